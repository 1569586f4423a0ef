/// Contained spaces and the request server running inside them
use crate::capability;
use crate::capp::{AppRegistry, AppState, ContainedApp};
use crate::capp_runtime;
use crate::factory::{self, ChildProcess, CloneRequest};
use crate::ipc::{packet_buffer, ControlChannel};
use crate::mount_jail::MountJail;
use crate::protocol::{
    self, Command, Request, Response, MAX_PACKET_SIZE, RECV_TIMEOUT,
};
use crate::types::{LxceError, Result, SpaceConfig, SpaceKind};
use crate::userns::{self, IdMap};

use caps::Capability;
use nix::sched::CloneFlags;
use nix::unistd::sethostname;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A validated space ready to be cloned
#[derive(Clone, Debug)]
pub struct ContainedSpace {
    pub name: String,
    pub hostname: String,
    pub rootfs: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub kind: SpaceKind,
    pub namespaces: CloneFlags,
    /// Configured capabilities, dropped on top of the kind bundles
    pub capabilities: Vec<Capability>,
    pub config_file: Option<PathBuf>,
}

impl ContainedSpace {
    pub fn from_config(config: &SpaceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            hostname: config.hostname.clone(),
            rootfs: config.rootfs_path(),
            uid: config.uid,
            gid: config.gid,
            kind: config.kind,
            namespaces: capability::parse_namespaces(&config.namespaces)?,
            capabilities: capability::parse_capabilities(&config.capabilities)?,
            config_file: config.config_file.clone(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_config(&SpaceConfig::from_file(path)?)
    }

    /// Clone the space and complete the user namespace handshake
    pub fn create(&self, user_ns: IdMap) -> Result<ChildProcess> {
        let request = CloneRequest::space(&self.name, self.namespaces, user_ns);
        let child = factory::spawn(&request, |channel| self.init_clone(channel))?;
        log::info!("Space: {} created with pid {}", self.name, child.pid);
        Ok(child)
    }

    /// Entry point of the cloned space process
    fn init_clone(&self, channel: &ControlChannel) -> isize {
        match self.setup(channel) {
            Ok(()) => {}
            Err(e) => {
                log::error!("Space: {} setup failed: {}", self.name, e);
                return 1;
            }
        }

        let mut server = SpaceServer::new(&self.name);
        match server.serve(channel) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("Space: {} server exited: {}", self.name, e);
                1
            }
        }
    }

    fn setup(&self, channel: &ControlChannel) -> Result<()> {
        if self.namespaces.contains(CloneFlags::CLONE_NEWUTS) {
            sethostname(&self.hostname).map_err(|e| {
                LxceError::NamespaceSetup(format!(
                    "Space: {} failed to set hostname {}: {}",
                    self.name, self.hostname, e
                ))
            })?;
        }

        capability::apply_space_profile(&self.name, self.kind, &self.capabilities)?;

        if self.namespaces.contains(CloneFlags::CLONE_NEWNS) {
            MountJail::new(&self.name, &self.rootfs).isolate()?;
        }

        userns::child_handshake(channel, self.uid, self.gid)?;
        log::info!(
            "Space: {} running as uid {} gid {} in {} ({} space)",
            self.name,
            self.uid,
            self.gid,
            self.rootfs.display(),
            self.kind
        );
        Ok(())
    }
}

/// Serves create/run/status requests and owns the apps of one space
pub struct SpaceServer {
    space: String,
    apps: Option<AppRegistry>,
    /// Pending apps are launched once the create reply is sent
    launch_pending: bool,
}

impl SpaceServer {
    pub fn new(space: &str) -> Self {
        Self {
            space: space.to_string(),
            apps: None,
            launch_pending: false,
        }
    }

    /// Apps known to this space, `None` until the first create
    pub fn apps(&self) -> Option<&AppRegistry> {
        self.apps.as_ref()
    }

    /// Request loop, returns only on a read error
    pub fn serve(&mut self, channel: &ControlChannel) -> Result<()> {
        channel.set_recv_timeout(RECV_TIMEOUT)?;
        let mut buffer = packet_buffer(MAX_PACKET_SIZE)?;

        loop {
            let len = match channel.recv(&mut buffer)? {
                Some(len) => len,
                None => {
                    self.reap();
                    continue;
                }
            };

            let raw = String::from_utf8_lossy(&buffer[..len]).into_owned();
            if let Some(response) = self.handle_packet(&raw) {
                channel.send(response.encode().as_bytes())?;
            }
            self.launch_queued();
            self.reap();
        }
    }

    fn reap(&mut self) {
        if let Some(apps) = self.apps.as_mut() {
            capp_runtime::reap_apps(&self.space, apps);
        }
    }

    /// Answer one raw request; `None` when it is dropped silently
    pub fn handle_packet(&mut self, raw: &str) -> Option<Response> {
        match Request::decode(raw) {
            Ok(request) => Some(self.dispatch(request)),
            Err(e) => match protocol::peek_header(raw) {
                Some((_, seqno)) => {
                    log::error!("Space: {} bad request {:?}: {}", self.space, raw, e);
                    Some(Response::error(seqno))
                }
                None => {
                    log::debug!("Space: {} ignoring {:?}: {}", self.space, raw, e);
                    None
                }
            },
        }
    }

    pub fn dispatch(&mut self, request: Request) -> Response {
        let seqno = request.seqno;
        match request.command {
            Command::Create { name, tag, path } => self.handle_create(seqno, &name, &tag, path),
            Command::Run { uuid } => self.handle_run(seqno, &uuid),
            Command::Status { uuid } => self.handle_status(seqno, &uuid),
        }
    }

    fn handle_create(&mut self, seqno: i32, name: &str, tag: &str, path: PathBuf) -> Response {
        let apps = self.apps.get_or_insert_with(AppRegistry::new);
        let uuid = Uuid::new_v4();

        let mut app = ContainedApp::new(name, tag, path, &self.space);
        app.uuid = Some(uuid);
        apps.add(app);

        log::info!(
            "Space: {} added app {}:{} as {}",
            self.space,
            name,
            tag,
            uuid
        );
        self.launch_pending = true;
        Response::uuid(seqno, uuid)
    }

    /// Launch a PENDING app, the uuid is returned only once it runs
    fn handle_run(&mut self, seqno: i32, uuid: &Uuid) -> Response {
        if let Some(AppState::Pending) = self.find(uuid) {
            if let Some(apps) = self.apps.as_mut() {
                if let Some(id) = apps.find_by_uuid(uuid) {
                    capp_runtime::launch_one(&self.space, apps, id);
                }
            }
        }

        match self.find(uuid) {
            Some(AppState::Run) => Response::uuid(seqno, *uuid),
            _ => Response::error(seqno),
        }
    }

    /// ERROR once the app is gone, unknown or failed to start
    fn handle_status(&mut self, seqno: i32, uuid: &Uuid) -> Response {
        match self.find(uuid) {
            Some(AppState::Pending) | Some(AppState::Create) | Some(AppState::Run) => {
                Response::uuid(seqno, *uuid)
            }
            _ => Response::error(seqno),
        }
    }

    fn find(&self, uuid: &Uuid) -> Option<AppState> {
        let apps = self.apps.as_ref()?;
        let id = apps.find_by_uuid(uuid)?;
        apps.get(id).map(|app| app.state)
    }

    /// Start pending apps queued by a create, once its reply is on its way
    pub fn launch_queued(&mut self) {
        if !std::mem::take(&mut self.launch_pending) {
            return;
        }
        if let Some(apps) = self.apps.as_mut() {
            capp_runtime::create_and_run_pending(&self.space, apps);
        }
    }
}
