/// Launching and reaping contained apps from inside a space
use crate::capability;
use crate::capp::{AppId, AppRegistry, AppState};
use crate::factory::{self, CloneRequest};
use crate::ipc::ControlChannel;
use crate::mount_jail::MountJail;
use crate::types::{AppConfig, LxceError, Result, CAPP_CONFIG_FILE};

use caps::Capability;
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvpe, Pid};
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Read `<bundle>/config.json` of an app
pub fn load_app_config(bundle: &Path) -> Result<AppConfig> {
    let path = bundle.join(CAPP_CONFIG_FILE);
    if !path.is_file() {
        return Err(LxceError::Config(format!(
            "Missing app config: {}",
            path.display()
        )));
    }
    AppConfig::from_file(&path)
}

/// App config resolved into what the child needs, built before cloning
struct PreparedExec {
    label: String,
    rootfs: PathBuf,
    unshare: CloneFlags,
    capabilities: Vec<Capability>,
    program: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
}

impl PreparedExec {
    fn new(label: &str, bundle: &Path, config: &AppConfig) -> Result<Self> {
        let to_cstring = |s: &str| {
            CString::new(s)
                .map_err(|e| LxceError::Config(format!("{}: invalid string {:?}: {}", label, s, e)))
        };

        let flags = capability::parse_namespaces(&config.namespaces)?;
        Ok(Self {
            label: label.to_string(),
            rootfs: bundle.to_path_buf(),
            unshare: flags - CloneFlags::CLONE_NEWUSER,
            capabilities: capability::parse_capabilities(&config.capabilities)?,
            program: to_cstring(&config.process.exec)?,
            argv: config
                .exec_argv()
                .iter()
                .map(|s| to_cstring(s))
                .collect::<Result<_>>()?,
            env: config
                .process
                .env
                .iter()
                .map(|s| to_cstring(s))
                .collect::<Result<_>>()?,
        })
    }

    /// Child side: isolate, drop capabilities and exec
    ///
    /// Only returns on failure, after reporting the errno to the parent.
    fn exec(&self, channel: &ControlChannel) -> isize {
        let errno = match self.setup() {
            Ok(()) => match execvpe(&self.program, &self.argv, &self.env) {
                Ok(never) => match never {},
                Err(e) => e,
            },
            Err(e) => {
                log::error!("{}: {}", self.label, e);
                Errno::EPERM
            }
        };

        let _ = channel.send_int(errno as i32);
        errno as isize
    }

    fn setup(&self) -> Result<()> {
        if !self.unshare.is_empty() {
            unshare(self.unshare).map_err(|e| {
                LxceError::NamespaceSetup(format!("{}: unshare failed: {}", self.label, e))
            })?;
        }
        if self.unshare.contains(CloneFlags::CLONE_NEWNS) {
            MountJail::new(&self.label, &self.rootfs).isolate()?;
        }
        if !self.capabilities.is_empty() {
            capability::drop_capabilities(&self.label, &self.capabilities)?;
        }
        Ok(())
    }
}

/// Clone and exec one app, returns the pid once exec succeeded
pub fn launch(label: &str, bundle: &Path, config: &AppConfig) -> Result<Pid> {
    let prepared = PreparedExec::new(label, bundle, config)?;
    let child = factory::spawn(&CloneRequest::app(label), |channel| prepared.exec(channel))?;

    // EOF means the close-on-exec end went away with a successful exec
    match child.channel.recv_int() {
        Ok(None) => Ok(child.pid),
        Ok(Some(errno)) => {
            let _ = waitpid(child.pid, None);
            Err(LxceError::Process(format!(
                "{}: exec failed: {}",
                label,
                Errno::from_i32(errno)
            )))
        }
        Err(e) => {
            factory::destroy(child.pid);
            Err(e)
        }
    }
}

/// Launch every PENDING app
///
/// Apps whose config is not there yet stay PENDING for the next pass. Apps
/// that fail to start become INVALID. Returns the number of apps now running.
pub fn create_and_run_pending(space: &str, apps: &mut AppRegistry) -> usize {
    let mut launched = 0;

    for id in apps.ids_in_state(AppState::Pending) {
        if launch_one(space, apps, id) {
            launched += 1;
        }
    }

    launched
}

/// Launch a single PENDING app, true when it reached RUN
pub fn launch_one(space: &str, apps: &mut AppRegistry, id: AppId) -> bool {
    let (label, bundle) = match apps.get(id) {
        Some(app) if app.state == AppState::Pending => (app.label(), app.path.clone()),
        _ => return false,
    };

    let config = match load_app_config(&bundle) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Space: {} app {} not started: {}", space, label, e);
            return false;
        }
    };

    if let Err(e) = apps.transition(id, AppState::Pending, AppState::Create) {
        log::error!("Space: {} {}", space, e);
        return false;
    }

    match launch(&label, &bundle, &config) {
        Ok(pid) => {
            if let Some(app) = apps.get_mut(id) {
                app.pid = Some(pid);
            }
            match apps.transition(id, AppState::Create, AppState::Run) {
                Ok(()) => {
                    log::info!("Space: {} app {} running as pid {}", space, label, pid);
                    true
                }
                Err(e) => {
                    log::error!("Space: {} {}", space, e);
                    false
                }
            }
        }
        Err(e) => {
            log::error!("Space: {} app {} failed to start: {}", space, label, e);
            let _ = apps.transition(id, AppState::Create, AppState::Invalid);
            false
        }
    }
}

/// Reap exited apps and move them to TERM
pub fn reap_apps(space: &str, apps: &mut AppRegistry) -> usize {
    let mut reaped = 0;

    for id in apps.ids_in_state(AppState::Run) {
        let pid = match apps.get(id).and_then(|app| app.pid) {
            Some(pid) => pid,
            None => continue,
        };

        let exit_status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
            Ok(_) => continue,
            Err(Errno::ECHILD) => -1,
            Err(e) => {
                log::warn!("Space: {} waitpid on {} failed: {}", space, pid, e);
                continue;
            }
        };

        if let Some(app) = apps.get_mut(id) {
            app.exit_status = Some(exit_status);
            log::info!(
                "Space: {} app {} exited with status {}",
                space,
                app.label(),
                exit_status
            );
        }
        if apps.transition(id, AppState::Run, AppState::Term).is_ok() {
            reaped += 1;
        }
    }

    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capp::ContainedApp;
    use std::fs;
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, exec: &str) {
        fs::write(
            dir.join(CAPP_CONFIG_FILE),
            format!(r#"{{"process": {{"exec": "{}", "argv": [], "env": []}}}}"#, exec),
        )
        .unwrap();
    }

    #[test]
    fn test_missing_config_stays_pending() {
        let bundle = TempDir::new().unwrap();
        let mut apps = AppRegistry::new();
        let id = apps.add(ContainedApp::new("a", "v1", bundle.path().to_path_buf(), "s1"));

        assert_eq!(create_and_run_pending("s1", &mut apps), 0);
        assert_eq!(apps.get(id).unwrap().state, AppState::Pending);
    }

    #[test]
    fn test_exec_failure_marks_invalid() {
        let bundle = TempDir::new().unwrap();
        write_bundle(bundle.path(), "/nonexistent/lxce-test-binary");
        let mut apps = AppRegistry::new();
        let id = apps.add(ContainedApp::new("a", "v1", bundle.path().to_path_buf(), "s1"));

        assert_eq!(create_and_run_pending("s1", &mut apps), 0);
        assert_eq!(apps.get(id).unwrap().state, AppState::Invalid);
    }

    #[test]
    fn test_launch_and_reap() {
        let bundle = TempDir::new().unwrap();
        write_bundle(bundle.path(), "true");
        let mut apps = AppRegistry::new();
        let id = apps.add(ContainedApp::new("t", "v1", bundle.path().to_path_buf(), "s1"));

        assert_eq!(create_and_run_pending("s1", &mut apps), 1);
        assert_eq!(apps.get(id).unwrap().state, AppState::Run);

        let mut reaped = 0;
        for _ in 0..100 {
            reaped += reap_apps("s1", &mut apps);
            if reaped > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(reaped, 1);
        let app = apps.get(id).unwrap();
        assert_eq!(app.state, AppState::Term);
        assert_eq!(app.exit_status, Some(0));
    }
}
