/// Process factory shared by spaces and apps
use crate::ipc::ControlChannel;
use crate::types::{LxceError, Result};
use crate::userns::{self, IdMap};

use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::os::fd::AsRawFd;

/// Stack given to every cloned child
pub const STACK_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaKind {
    /// Contained space, cloned with its configured namespaces
    Space,
    /// Contained app, cloned without new namespaces
    App,
}

/// Everything the factory needs to clone one child
#[derive(Clone, Debug)]
pub struct CloneRequest<'a> {
    pub kind: AreaKind,
    pub name: &'a str,
    pub flags: CloneFlags,
    /// Run the user namespace handshake with the child
    pub user_ns: Option<IdMap>,
}

impl<'a> CloneRequest<'a> {
    pub fn space(name: &'a str, flags: CloneFlags, user_ns: IdMap) -> Self {
        Self {
            kind: AreaKind::Space,
            name,
            flags,
            user_ns: Some(user_ns),
        }
    }

    pub fn app(name: &'a str) -> Self {
        Self {
            kind: AreaKind::App,
            name,
            flags: CloneFlags::empty(),
            user_ns: None,
        }
    }

    /// Flags actually passed to clone
    ///
    /// The user namespace is created by the child through the handshake, and
    /// apps never get namespaces from the factory.
    pub fn clone_flags(&self) -> CloneFlags {
        match self.kind {
            AreaKind::Space => self.flags - CloneFlags::CLONE_NEWUSER,
            AreaKind::App => CloneFlags::empty(),
        }
    }
}

/// A cloned child and the parent end of its control channel
#[derive(Debug)]
pub struct ChildProcess {
    pub pid: Pid,
    pub channel: ControlChannel,
}

/// Clone a child running `entry` with the child end of a fresh control channel
///
/// `entry` runs in the child and its return value becomes the exit code.
///
/// The child is a raw clone of a multi-threaded process: locks held by other
/// threads at clone time (allocator, logger) stay held in the child. `entry`
/// keeps its success path free of logging and light on allocation until it
/// execs or the handshake has let it through.
pub fn spawn<F>(request: &CloneRequest<'_>, mut entry: F) -> Result<ChildProcess>
where
    F: FnMut(&ControlChannel) -> isize,
{
    let (parent, child) = ControlChannel::pair()?;

    let parent_fd = parent.as_raw_fd();
    let mut stack = vec![0u8; STACK_SIZE];
    let callback = Box::new(|| {
        unsafe { libc::close(parent_fd) };
        entry(&child)
    });

    let pid = unsafe {
        clone(
            callback,
            &mut stack,
            request.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| LxceError::Process(format!("{}: clone failed: {}", request.name, e)))?;
    drop(child);

    log::debug!("{}: cloned child with pid {}", request.name, pid);

    if let Some(ref map) = request.user_ns {
        if let Err(e) = userns::parent_handshake(&parent, pid, map) {
            log::error!("{}: user namespace handshake failed: {}", request.name, e);
            destroy(pid);
            return Err(e);
        }
    }

    Ok(ChildProcess {
        pid,
        channel: parent,
    })
}

/// Kill and reap a child
pub fn destroy(pid: Pid) {
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        log::warn!("Failed to kill {}: {}", pid, e);
    }
    if let Err(e) = waitpid(pid, None) {
        log::warn!("Failed to reap {}: {}", pid, e);
    }
}
