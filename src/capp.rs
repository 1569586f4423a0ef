/// Contained application model
///
/// Apps live in a single arena and are filtered by state. Moving an app
/// between states is checked so it is only ever in one of them.
use crate::types::{LxceError, ManifestEntry, Result};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AppState {
    Pending,
    Create,
    Run,
    Term,
    Invalid,
}

impl AppState {
    pub fn can_transition(self, to: AppState) -> bool {
        use AppState::*;
        matches!(
            (self, to),
            (Pending, Create)
                | (Pending, Invalid)
                | (Create, Run)
                | (Create, Invalid)
                | (Run, Term)
                | (Run, Invalid)
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Pending => "pending",
            AppState::Create => "create",
            AppState::Run => "run",
            AppState::Term => "term",
            AppState::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub struct ContainedApp {
    pub name: String,
    pub tag: String,
    /// Bundle directory inside the space
    pub path: PathBuf,
    /// Space the app belongs to
    pub space: String,
    pub uuid: Option<Uuid>,
    pub state: AppState,
    pub restart: bool,
    pub pid: Option<Pid>,
    pub exit_status: Option<i32>,
    pub changed_at: DateTime<Utc>,
}

impl ContainedApp {
    pub fn new(name: &str, tag: &str, path: PathBuf, space: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            path,
            space: space.to_string(),
            uuid: None,
            state: AppState::Pending,
            restart: false,
            pid: None,
            exit_status: None,
            changed_at: Utc::now(),
        }
    }

    /// Build an app from a manifest entry, `None` for incomplete entries
    pub fn from_manifest(entry: &ManifestEntry) -> Option<Self> {
        if !entry.is_valid() {
            return None;
        }
        let mut app = Self::new(
            entry.name.as_deref()?,
            entry.tag.as_deref()?,
            entry.bundle_path()?,
            entry.contained.as_deref()?,
        );
        app.restart = entry.restart;
        Some(app)
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Index of an app in its registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub usize);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: Vec<ContainedApp>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an app, always in the PENDING state
    pub fn add(&mut self, mut app: ContainedApp) -> AppId {
        app.state = AppState::Pending;
        app.changed_at = Utc::now();
        self.apps.push(app);
        AppId(self.apps.len() - 1)
    }

    pub fn get(&self, id: AppId) -> Option<&ContainedApp> {
        self.apps.get(id.0)
    }

    pub fn get_mut(&mut self, id: AppId) -> Option<&mut ContainedApp> {
        self.apps.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AppId, &ContainedApp)> {
        self.apps.iter().enumerate().map(|(i, app)| (AppId(i), app))
    }

    pub fn in_state(&self, state: AppState) -> impl Iterator<Item = (AppId, &ContainedApp)> {
        self.iter().filter(move |(_, app)| app.state == state)
    }

    pub fn ids_in_state(&self, state: AppState) -> Vec<AppId> {
        self.in_state(state).map(|(id, _)| id).collect()
    }

    pub fn count(&self, state: AppState) -> usize {
        self.in_state(state).count()
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<AppId> {
        self.iter()
            .find(|(_, app)| app.uuid.as_ref() == Some(uuid))
            .map(|(id, _)| id)
    }

    /// Move an app from `from` to `to`
    ///
    /// Fails when the app is not currently in `from` or the move is not allowed.
    pub fn transition(&mut self, id: AppId, from: AppState, to: AppState) -> Result<()> {
        let app = self
            .apps
            .get_mut(id.0)
            .ok_or_else(|| LxceError::Process(format!("No app with id {}", id)))?;

        if app.state != from {
            return Err(LxceError::Process(format!(
                "App {} is {} not {}",
                app.label(),
                app.state,
                from
            )));
        }
        if !from.can_transition(to) {
            return Err(LxceError::Process(format!(
                "App {}: invalid transition {} -> {}",
                app.label(),
                from,
                to
            )));
        }

        log::debug!("App {}: {} -> {}", app.label(), from, to);
        app.state = to;
        app.changed_at = Utc::now();
        Ok(())
    }
}
