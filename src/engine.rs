/// Top-level orchestrator: spaces, apps and the main loop
use crate::cspace::ContainedSpace;
use crate::manager::CAppManager;
use crate::network::{NetworkAttach, NoNetwork};
use crate::space_thread::{SpaceRegistry, ThreadOptions};
use crate::types::{LxceConfig, LxceError, Manifest, Result};
use crate::userns::IdMap;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Records the engine pid at start and appends `,<status>` at exit
#[derive(Clone, Debug)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn started(&self, pid: u32) -> Result<()> {
        fs::write(&self.path, pid.to_string()).map_err(|e| {
            LxceError::Config(format!(
                "Unable to write status file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    pub fn exited(&self, status: i32) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                LxceError::Config(format!(
                    "Unable to open status file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        write!(file, ",{}", status)?;
        Ok(())
    }
}

pub struct Engine {
    config: LxceConfig,
    spaces: Vec<ContainedSpace>,
    registry: SpaceRegistry,
    manager: CAppManager,
    network: Arc<dyn NetworkAttach>,
}

impl Engine {
    pub fn new(config: LxceConfig, spaces: Vec<ContainedSpace>) -> Self {
        let manager = CAppManager::new(config.status_interval());
        Self {
            config,
            spaces,
            registry: SpaceRegistry::new(),
            manager,
            network: Arc::new(NoNetwork),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkAttach>) -> Self {
        self.network = network;
        self
    }

    /// Load the orchestrator config and every space config it names
    pub fn load(config_file: &Path) -> Result<Self> {
        Self::from_config(LxceConfig::from_file(config_file)?)
    }

    pub fn from_config(config: LxceConfig) -> Result<Self> {
        let spaces = config
            .config
            .spaces
            .iter()
            .map(|path| ContainedSpace::from_file(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(config, spaces))
    }

    pub fn config(&self) -> &LxceConfig {
        &self.config
    }

    pub fn spaces(&self) -> &[ContainedSpace] {
        &self.spaces
    }

    pub fn manager(&self) -> &CAppManager {
        &self.manager
    }

    /// Start every space, then register and start the manifest apps
    pub fn start(&mut self) -> Result<()> {
        let options = ThreadOptions {
            poll_interval: self.config.poll_interval(),
            user_ns: IdMap::from(self.config.user_ns),
        };

        for space in &self.spaces {
            self.registry
                .start(space.clone(), options, Arc::clone(&self.network))?;
        }
        self.registry
            .wait_until_started(self.config.start_timeout())?;
        log::info!("All {} spaces are active", self.registry.len());

        let manifest_path = &self.config.config.manifest;
        let manifest = match Manifest::from_file(manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!(
                    "Manifest {} not loaded, no apps to start: {}",
                    manifest_path.display(),
                    e
                );
                Manifest::default()
            }
        };

        let added = self.manager.load_manifest(&manifest);
        let requested = self.manager.start(&self.registry);
        log::info!("Manifest: {} apps registered, {} create requests sent", added, requested);
        Ok(())
    }

    /// One pass of the main loop
    pub fn tick(&mut self) -> Result<()> {
        if let Some(fatal) = self.registry.fatal_error() {
            return Err(LxceError::Process(fatal));
        }
        if self.manager.process_completions(&self.registry) > 0 {
            log::debug!("Apps: {}", self.manager.summary());
        }
        self.manager.poll_status(&self.registry, Instant::now());
        Ok(())
    }

    /// Run the main loop until `stop` returns true
    pub fn run_until<F: Fn() -> bool>(&mut self, stop: F) -> Result<()> {
        let interval = self.config.poll_interval();
        while !stop() {
            self.tick()?;
            thread::sleep(interval);
        }
        Ok(())
    }

    /// Tear every space down and wait for the threads
    pub fn shutdown(&mut self) {
        log::info!("Shutting down {} spaces", self.registry.len());
        self.registry.shutdown();
    }
}
