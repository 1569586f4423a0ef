/// Orchestrator-side bookkeeping of contained apps
///
/// Apps move PENDING -> CREATE once their space hands out a uuid and
/// CREATE -> RUN once the run request is accepted. A failed create or run
/// makes them INVALID, a failed status poll TERM.
use crate::capp::{AppId, AppRegistry, AppState, ContainedApp};
use crate::mailbox::{Completion, ControlPacket, Mailbox};
use crate::protocol::{Command, Reply, CMD_CREATE, CMD_RUN, CMD_STATUS};
use crate::space_thread::MailboxDirectory;
use crate::types::Manifest;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct CAppManager {
    apps: AppRegistry,
    inflight: HashSet<AppId>,
    status_interval: Duration,
    last_status_poll: Option<Instant>,
}

impl CAppManager {
    pub fn new(status_interval: Duration) -> Self {
        Self {
            apps: AppRegistry::new(),
            inflight: HashSet::new(),
            status_interval,
            last_status_poll: None,
        }
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.apps
    }

    /// Register every complete manifest entry as a PENDING app
    pub fn load_manifest(&mut self, manifest: &Manifest) -> usize {
        let mut added = 0;
        for entry in &manifest.capps {
            match ContainedApp::from_manifest(entry) {
                Some(app) => {
                    log::debug!("Manifest: adding {} to space {}", app.label(), app.space);
                    self.apps.add(app);
                    added += 1;
                }
                None => log::error!("Manifest: skipping incomplete entry {:?}", entry),
            }
        }
        added
    }

    /// Send a create request for every PENDING app not already in flight
    pub fn start<D: MailboxDirectory>(&mut self, spaces: &D) -> usize {
        let mut batch = Batch::default();
        for id in self.apps.ids_in_state(AppState::Pending) {
            if self.inflight.contains(&id) {
                continue;
            }
            let command = match self.apps.get(id) {
                Some(app) => Command::Create {
                    name: app.name.clone(),
                    tag: app.tag.clone(),
                    path: app.path.clone(),
                },
                None => continue,
            };
            self.request(spaces, &mut batch, id, command);
        }
        batch.notify()
    }

    /// Apply completions posted by the space threads
    pub fn process_completions<D: MailboxDirectory>(&mut self, spaces: &D) -> usize {
        let mut applied = 0;
        let mut to_run = Vec::new();

        for mailbox in spaces.mailboxes() {
            for completion in mailbox.take_completions() {
                if let Some(id) = self.apply(completion) {
                    to_run.push(id);
                }
                applied += 1;
            }
        }

        let mut batch = Batch::default();
        for id in to_run {
            if let Some(uuid) = self.apps.get(id).and_then(|app| app.uuid) {
                self.request(spaces, &mut batch, id, Command::Run { uuid });
            }
        }
        batch.notify();

        applied
    }

    /// Ask for the status of RUN apps once per status interval
    pub fn poll_status<D: MailboxDirectory>(&mut self, spaces: &D, now: Instant) -> usize {
        if let Some(last) = self.last_status_poll {
            if now.saturating_duration_since(last) < self.status_interval {
                return 0;
            }
        }
        self.last_status_poll = Some(now);

        let mut batch = Batch::default();
        for id in self.apps.ids_in_state(AppState::Run) {
            if self.inflight.contains(&id) {
                continue;
            }
            if let Some(uuid) = self.apps.get(id).and_then(|app| app.uuid) {
                self.request(spaces, &mut batch, id, Command::Status { uuid });
            }
        }
        batch.notify()
    }

    fn request<D: MailboxDirectory>(
        &mut self,
        spaces: &D,
        batch: &mut Batch,
        id: AppId,
        command: Command,
    ) {
        let space = match self.apps.get(id) {
            Some(app) => app.space.clone(),
            None => return,
        };

        match spaces.mailbox_for(&space) {
            Some(mailbox) => {
                mailbox.enqueue(ControlPacket::new(id.0 as u64, command));
                self.inflight.insert(id);
                batch.touch(mailbox);
            }
            None => {
                log::error!("No live space {} for app {}", space, id);
                self.invalidate(id);
            }
        }
    }

    /// Returns the app to send a run request for, if any
    fn apply(&mut self, completion: Completion) -> Option<AppId> {
        let id = AppId(completion.token as usize);
        self.inflight.remove(&id);

        let label = match self.apps.get(id) {
            Some(app) => app.label(),
            None => {
                log::warn!("Completion for unknown app {}", id);
                return None;
            }
        };

        let result = match (completion.command, &completion.reply) {
            (CMD_CREATE, Reply::Uuid(uuid)) => {
                if let Some(app) = self.apps.get_mut(id) {
                    app.uuid = Some(*uuid);
                }
                log::info!("App {} created as {}", label, uuid);
                return match self.apps.transition(id, AppState::Pending, AppState::Create) {
                    Ok(()) => Some(id),
                    Err(e) => {
                        log::error!("{}", e);
                        None
                    }
                };
            }
            (CMD_CREATE, Reply::Error) => {
                self.apps
                    .transition(id, AppState::Pending, AppState::Invalid)
            }
            (CMD_RUN, Reply::Uuid(_)) => {
                log::info!("App {} is running", label);
                self.apps.transition(id, AppState::Create, AppState::Run)
            }
            (CMD_RUN, Reply::Error) => {
                self.apps.transition(id, AppState::Create, AppState::Invalid)
            }
            (CMD_STATUS, Reply::Uuid(_)) => Ok(()),
            (CMD_STATUS, Reply::Error) => {
                log::info!("App {} has terminated", label);
                self.apps.transition(id, AppState::Run, AppState::Term)
            }
            (command, reply) => {
                log::warn!("App {}: unexpected completion {} {}", label, command, reply);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::error!("{}", e);
        }
        None
    }

    fn invalidate(&mut self, id: AppId) {
        let state = match self.apps.get(id) {
            Some(app) => app.state,
            None => return,
        };
        if let Err(e) = self.apps.transition(id, state, AppState::Invalid) {
            log::error!("{}", e);
        }
    }

    /// Per-state counts, for logging
    pub fn summary(&self) -> String {
        [
            AppState::Pending,
            AppState::Create,
            AppState::Run,
            AppState::Term,
            AppState::Invalid,
        ]
        .iter()
        .map(|state| format!("{}={}", state, self.apps.count(*state)))
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Mailboxes touched by one round of requests, each signalled once
#[derive(Default)]
struct Batch {
    mailboxes: Vec<Arc<Mailbox>>,
    requests: usize,
}

impl Batch {
    fn touch(&mut self, mailbox: Arc<Mailbox>) {
        self.requests += 1;
        if !self.mailboxes.iter().any(|m| Arc::ptr_eq(m, &mailbox)) {
            self.mailboxes.push(mailbox);
        }
    }

    fn notify(self) -> usize {
        for mailbox in &self.mailboxes {
            mailbox.notify();
        }
        self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManifestEntry;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct Spaces(Vec<Arc<Mailbox>>);

    impl MailboxDirectory for Spaces {
        fn mailbox_for(&self, space: &str) -> Option<Arc<Mailbox>> {
            self.0.iter().find(|m| m.name() == space).cloned()
        }

        fn mailboxes(&self) -> Vec<Arc<Mailbox>> {
            self.0.clone()
        }
    }

    fn entry(name: &str, space: &str) -> ManifestEntry {
        ManifestEntry {
            name: Some(name.to_string()),
            tag: Some("v1".to_string()),
            contained: Some(space.to_string()),
            restart: false,
            path: None,
        }
    }

    fn manager_with(entries: Vec<ManifestEntry>) -> CAppManager {
        let mut manager = CAppManager::new(Duration::from_secs(10));
        manager.load_manifest(&Manifest {
            version: None,
            target: None,
            capps: entries,
        });
        manager
    }

    fn reply_all(mailbox: &Mailbox, reply: impl Fn(&Command) -> Reply) {
        let batch = mailbox.wait_for_work(Duration::ZERO);
        for packet in batch.packets {
            mailbox.push_completion(Completion {
                token: packet.token,
                command: packet.command.name(),
                reply: reply(&packet.command),
            });
        }
    }

    #[test]
    fn test_start_sends_create_to_owning_space() {
        let spaces = Spaces(vec![Arc::new(Mailbox::new("s1")), Arc::new(Mailbox::new("s2"))]);
        let mut manager = manager_with(vec![entry("a", "s1"), entry("b", "s2"), entry("c", "s2")]);

        assert_eq!(manager.start(&spaces), 3);
        assert_eq!(spaces.0[0].pending(), 1);
        assert_eq!(spaces.0[1].pending(), 2);

        // already in flight
        assert_eq!(manager.start(&spaces), 0);

        let batch = spaces.0[0].wait_for_work(Duration::ZERO);
        assert_eq!(
            batch.packets[0].command,
            Command::Create {
                name: "a".to_string(),
                tag: "v1".to_string(),
                path: PathBuf::from("/capps/pkgs/a_v1"),
            }
        );
    }

    #[test]
    fn test_unknown_space_invalidates_app() {
        let spaces = Spaces(vec![Arc::new(Mailbox::new("s1"))]);
        let mut manager = manager_with(vec![entry("a", "nowhere")]);

        assert_eq!(manager.start(&spaces), 0);
        assert_eq!(manager.apps().count(AppState::Invalid), 1);
    }

    #[test]
    fn test_create_then_run() {
        let spaces = Spaces(vec![Arc::new(Mailbox::new("s1"))]);
        let mut manager = manager_with(vec![entry("a", "s1")]);
        manager.start(&spaces);

        let uuid = Uuid::new_v4();
        reply_all(&spaces.0[0], |_| Reply::Uuid(uuid));
        manager.process_completions(&spaces);

        let app = manager.apps().get(AppId(0)).unwrap();
        assert_eq!(app.state, AppState::Create);
        assert_eq!(app.uuid, Some(uuid));
        assert_eq!(spaces.0[0].pending(), 1);

        reply_all(&spaces.0[0], |command| match command {
            Command::Run { uuid } => Reply::Uuid(*uuid),
            _ => Reply::Error,
        });
        manager.process_completions(&spaces);
        assert_eq!(manager.apps().get(AppId(0)).unwrap().state, AppState::Run);
    }

    #[test]
    fn test_create_error_marks_invalid() {
        let spaces = Spaces(vec![Arc::new(Mailbox::new("s1"))]);
        let mut manager = manager_with(vec![entry("a", "s1"), entry("b", "s1")]);
        manager.start(&spaces);

        reply_all(&spaces.0[0], |_| Reply::Error);
        assert_eq!(manager.process_completions(&spaces), 2);
        assert_eq!(manager.apps().count(AppState::Invalid), 2);
        assert_eq!(manager.apps().count(AppState::Pending), 0);
    }

    #[test]
    fn test_status_error_terminates_app() {
        let spaces = Spaces(vec![Arc::new(Mailbox::new("s1"))]);
        let mut manager = manager_with(vec![entry("a", "s1")]);
        manager.start(&spaces);

        let uuid = Uuid::new_v4();
        reply_all(&spaces.0[0], |_| Reply::Uuid(uuid));
        manager.process_completions(&spaces);
        reply_all(&spaces.0[0], |_| Reply::Uuid(uuid));
        manager.process_completions(&spaces);

        let now = Instant::now();
        assert_eq!(manager.poll_status(&spaces, now), 1);
        // throttled until the interval elapses
        assert_eq!(manager.poll_status(&spaces, now), 0);

        reply_all(&spaces.0[0], |_| Reply::Error);
        manager.process_completions(&spaces);
        assert_eq!(manager.apps().get(AppId(0)).unwrap().state, AppState::Term);
        assert!(manager.summary().contains("term=1"));
    }

    #[test]
    fn test_incomplete_manifest_entries_skipped() {
        let mut incomplete = entry("b", "s1");
        incomplete.tag = None;
        let manager = manager_with(vec![entry("a", "s1"), incomplete]);
        assert_eq!(manager.apps().len(), 1);
    }
}
