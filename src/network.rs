/// Network attachment of a freshly created space
use crate::types::Result;

use nix::unistd::Pid;

/// Collaborator that wires a space's network namespace to the host
pub trait NetworkAttach: Send + Sync {
    fn attach(&self, space: &str, pid: Pid) -> Result<()>;
}

/// Used when no network collaborator is configured
#[derive(Clone, Copy, Debug, Default)]
pub struct NoNetwork;

impl NetworkAttach for NoNetwork {
    fn attach(&self, space: &str, pid: Pid) -> Result<()> {
        log::debug!(
            "Space: {} (pid {}) has no network collaborator, skipping attach",
            space,
            pid
        );
        Ok(())
    }
}
