/// Per-space worker threads and the registry that owns them
///
/// Each thread creates its space, then relays mailbox packets to the space
/// over the control channel and posts the responses back as completions.
/// Between batches it reaps the space so a dead space is noticed even when
/// no work arrives.
use crate::action::{ActionList, ActionState, OutstandingRequest};
use crate::cspace::ContainedSpace;
use crate::factory::{self, ChildProcess};
use crate::ipc::packet_buffer;
use crate::mailbox::{Completion, ControlPacket, Mailbox};
use crate::network::NetworkAttach;
use crate::protocol::{Reply, Request, Response, SeqAllocator, MAX_PACKET_SIZE, RECV_TIMEOUT};
use crate::types::{LxceError, Result};
use crate::userns::IdMap;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Create,
    Active,
    Abort,
    Deleted,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Create => write!(f, "create"),
            ThreadState::Active => write!(f, "active"),
            ThreadState::Abort => write!(f, "abort"),
            ThreadState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Why a space process is no longer running
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Normal(i32),
    Term(Signal),
    Stop(Signal),
}

impl ExitReason {
    /// Classify a wait status, `None` while the process is still running
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitReason::Normal(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitReason::Term(signal)),
            WaitStatus::Stopped(_, signal) => Some(ExitReason::Stop(signal)),
            _ => None,
        }
    }

    /// Value appended to the status file
    pub fn status_code(&self) -> i32 {
        match self {
            ExitReason::Normal(code) => *code,
            ExitReason::Term(signal) | ExitReason::Stop(signal) => 128 + *signal as i32,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal(code) => write!(f, "normal exit ({})", code),
            ExitReason::Term(signal) => write!(f, "terminated by {}", signal),
            ExitReason::Stop(signal) => write!(f, "stopped by {}", signal),
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    state: ThreadState,
    pid: Option<Pid>,
    exit: Option<ExitReason>,
    fatal: Option<String>,
}

/// State of a space thread, shared with the orchestrator
#[derive(Debug)]
pub struct ThreadStatus {
    inner: Mutex<StatusInner>,
    changed: Condvar,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: ThreadState::Create,
                pid: None,
                exit: None,
                fatal: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F: FnOnce(&mut StatusInner)>(&self, f: F) {
        let mut inner = self.lock();
        f(&mut inner);
        self.changed.notify_all();
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.lock().pid
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.lock().exit
    }

    pub fn fatal(&self) -> Option<String> {
        self.lock().fatal.clone()
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), ThreadState::Create | ThreadState::Active)
    }

    pub fn set_active(&self, pid: Pid) {
        self.update(|s| {
            s.state = ThreadState::Active;
            s.pid = Some(pid);
        });
    }

    pub fn set_abort(&self, reason: ExitReason) {
        self.update(|s| {
            s.state = ThreadState::Abort;
            s.exit = Some(reason);
        });
    }

    pub fn set_deleted(&self) {
        self.update(|s| s.state = ThreadState::Deleted);
    }

    pub fn set_fatal(&self, msg: String) {
        self.update(|s| {
            s.state = ThreadState::Abort;
            s.fatal = Some(msg);
        });
    }

    /// Block while the thread is still creating its space, at most `timeout`
    pub fn wait_while_creating(&self, timeout: Duration) -> ThreadState {
        let inner = self.lock();
        let (inner, _) = self
            .changed
            .wait_timeout_while(inner, timeout, |s| s.state == ThreadState::Create)
            .unwrap_or_else(PoisonError::into_inner);
        inner.state
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ThreadOptions {
    /// Mailbox wait bound and response receive timeout
    pub poll_interval: Duration,
    pub user_ns: IdMap,
}

/// Worker owning one space for its whole life
pub struct SpaceThread {
    space: ContainedSpace,
    mailbox: Arc<Mailbox>,
    status: Arc<ThreadStatus>,
    network: Arc<dyn NetworkAttach>,
    options: ThreadOptions,
    actions: ActionList,
    seq: SeqAllocator,
}

impl SpaceThread {
    pub fn new(
        space: ContainedSpace,
        mailbox: Arc<Mailbox>,
        status: Arc<ThreadStatus>,
        network: Arc<dyn NetworkAttach>,
        options: ThreadOptions,
    ) -> Self {
        Self {
            space,
            mailbox,
            status,
            network,
            options,
            actions: ActionList::new(),
            seq: SeqAllocator::new(),
        }
    }

    pub fn run(mut self) -> Result<()> {
        let child = match self.space.create(self.options.user_ns) {
            Ok(child) => child,
            Err(e) => {
                log::error!("Space: {} creation failed: {}", self.space.name, e);
                self.fail_queued();
                self.status.set_deleted();
                return Err(e);
            }
        };

        if let Err(e) = self.network.attach(&self.space.name, child.pid) {
            log::warn!("Space: {} network attach failed: {}", self.space.name, e);
        }
        self.status.set_active(child.pid);

        let result = self.serve(&child);
        if let Err(ref e) = result {
            log::error!("Space: {} thread failed: {}", self.space.name, e);
            self.status.set_fatal(e.to_string());
        }
        result
    }

    fn serve(&mut self, child: &ChildProcess) -> Result<()> {
        child.channel.set_recv_timeout(self.options.poll_interval)?;
        let mut buffer = packet_buffer(MAX_PACKET_SIZE)?;

        loop {
            if let Some(reason) = self.reap(child.pid)? {
                log::error!("Space: {} is gone: {}", self.space.name, reason);
                if let ExitReason::Stop(_) = reason {
                    factory::destroy(child.pid);
                }
                self.status.set_abort(reason);
                self.abandon();
                return Ok(());
            }

            let timeout = if self.actions.waiting() > 0 {
                Duration::ZERO
            } else {
                self.options.poll_interval
            };
            let batch = self.mailbox.wait_for_work(timeout);

            if batch.closed {
                self.fail_packets(batch.packets);
                self.teardown(child);
                return Ok(());
            }

            for packet in batch.packets {
                self.send(child, packet);
            }
            self.receive(child, &mut buffer);
            self.report_overdue();
            self.flush();
        }
    }

    fn reap(&self, pid: Pid) -> Result<Option<ExitReason>> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        match waitpid(pid, Some(flags)) {
            Ok(status) => Ok(ExitReason::from_wait_status(status)),
            Err(e) => Err(LxceError::Process(format!(
                "Space: {} waitpid on {} failed: {}",
                self.space.name, pid, e
            ))),
        }
    }

    fn send(&mut self, child: &ChildProcess, packet: ControlPacket) {
        let seqno = self.actions.next_seqno(&mut self.seq);
        let request = Request::new(seqno, packet.command);
        let encoded = request.encode();

        let mut outstanding = OutstandingRequest::new(
            seqno,
            request.command.name(),
            request.command.params(),
            packet.token,
        );

        match child.channel.send(encoded.as_bytes()) {
            Ok(()) => {
                log::debug!("Space: {} sent {:?}", self.space.name, encoded);
                self.actions.insert(outstanding);
            }
            Err(e) => {
                log::error!(
                    "Space: {} failed to send {:?}: {}",
                    self.space.name,
                    encoded,
                    e
                );
                outstanding.state = ActionState::Error;
                outstanding.reply = Some(Reply::Error);
                self.actions.insert(outstanding);
            }
        }
    }

    fn receive(&mut self, child: &ChildProcess, buffer: &mut [u8]) {
        let mut blocking = true;
        while self.actions.waiting() > 0 {
            let received = if blocking {
                child.channel.recv(buffer)
            } else {
                child.channel.try_recv(buffer)
            };
            blocking = false;

            match received {
                Ok(Some(len)) => {
                    let raw = String::from_utf8_lossy(&buffer[..len]);
                    self.on_response(&raw);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Space: {} receive failed: {}", self.space.name, e);
                    break;
                }
            }
        }
    }

    fn on_response(&mut self, raw: &str) {
        match Response::decode(raw) {
            Ok(response) => {
                if !self.actions.complete(&response) {
                    log::warn!(
                        "Space: {} response {:?} matches no request",
                        self.space.name,
                        raw
                    );
                }
            }
            Err(e) => log::warn!("Space: {} bad response {:?}: {}", self.space.name, raw, e),
        }
    }

    fn report_overdue(&mut self) {
        for request in self.actions.take_overdue(Instant::now(), RECV_TIMEOUT) {
            log::warn!(
                "Space: {} no response to {} {} {} after {:?}",
                self.space.name,
                request.command,
                request.seqno,
                request.params,
                request.sent_at.elapsed()
            );
        }
    }

    fn flush(&mut self) {
        for finished in self.actions.drain_finished() {
            self.mailbox.push_completion(Completion {
                token: finished.token,
                command: finished.command,
                reply: finished.reply.unwrap_or(Reply::Error),
            });
        }
    }

    /// Packets that will never reach a space are answered with ERROR
    fn fail_queued(&mut self) {
        let batch = self.mailbox.wait_for_work(Duration::ZERO);
        self.fail_packets(batch.packets);
    }

    fn fail_packets(&self, packets: Vec<ControlPacket>) {
        for packet in packets {
            self.mailbox.push_completion(Completion {
                token: packet.token,
                command: packet.command.name(),
                reply: Reply::Error,
            });
        }
    }

    fn abandon(&mut self) {
        let failed = self.actions.fail_all();
        if failed > 0 {
            log::warn!(
                "Space: {} failed {} outstanding requests",
                self.space.name,
                failed
            );
        }
        self.flush();
        self.fail_queued();
    }

    fn teardown(&mut self, child: &ChildProcess) {
        log::info!("Space: {} shutting down (pid {})", self.space.name, child.pid);
        factory::destroy(child.pid);
        self.abandon();
        self.status.set_deleted();
    }
}

/// Index of a space in the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceId(pub usize);

pub struct SpaceHandle {
    pub name: String,
    pub uuid: Uuid,
    pub mailbox: Arc<Mailbox>,
    pub status: Arc<ThreadStatus>,
    join: Option<JoinHandle<Result<()>>>,
}

/// Finds the mailbox of a space by name
pub trait MailboxDirectory {
    /// Mailbox of a live space
    fn mailbox_for(&self, space: &str) -> Option<Arc<Mailbox>>;

    fn mailboxes(&self) -> Vec<Arc<Mailbox>>;
}

/// Every space thread of the orchestrator
#[derive(Default)]
pub struct SpaceRegistry {
    spaces: Vec<SpaceHandle>,
}

impl SpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn get(&self, id: SpaceId) -> Option<&SpaceHandle> {
        self.spaces.get(id.0)
    }

    pub fn find(&self, name: &str) -> Option<&SpaceHandle> {
        self.spaces.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpaceHandle> {
        self.spaces.iter()
    }

    fn register(
        &mut self,
        name: &str,
        mailbox: Arc<Mailbox>,
        status: Arc<ThreadStatus>,
    ) -> Result<SpaceId> {
        if self.find(name).is_some() {
            return Err(LxceError::Config(format!("Duplicate space name: {}", name)));
        }
        self.spaces.push(SpaceHandle {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            mailbox,
            status,
            join: None,
        });
        Ok(SpaceId(self.spaces.len() - 1))
    }

    /// Register a space and start its thread
    pub fn start(
        &mut self,
        space: ContainedSpace,
        options: ThreadOptions,
        network: Arc<dyn NetworkAttach>,
    ) -> Result<SpaceId> {
        let name = space.name.clone();
        let mailbox = Arc::new(Mailbox::new(&name));
        let status = Arc::new(ThreadStatus::new());
        let id = self.register(&name, Arc::clone(&mailbox), Arc::clone(&status))?;

        let worker = SpaceThread::new(space, mailbox, Arc::clone(&status), network, options);
        let join = thread::Builder::new()
            .name(format!("cspace-{}", name))
            .spawn(move || worker.run());

        match join {
            Ok(join) => {
                if let Some(handle) = self.spaces.get_mut(id.0) {
                    handle.join = Some(join);
                    log::info!("Space: {} thread started as {}", name, handle.uuid);
                }
                Ok(id)
            }
            Err(e) => {
                status.set_deleted();
                Err(LxceError::Process(format!(
                    "Space: {} failed to start thread: {}",
                    name, e
                )))
            }
        }
    }

    /// Wait for every space to leave CREATE
    ///
    /// Fails if a space is still being created at the deadline or its
    /// creation failed.
    pub fn wait_until_started(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        for space in &self.spaces {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match space.status.wait_while_creating(remaining) {
                ThreadState::Active => {}
                ThreadState::Create => {
                    return Err(LxceError::Process(format!(
                        "Space: {} not created within {:?}",
                        space.name, timeout
                    )))
                }
                state => {
                    return Err(LxceError::Process(format!(
                        "Space: {} failed to start ({})",
                        space.name, state
                    )))
                }
            }
        }
        Ok(())
    }

    /// First unrecoverable thread error, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.spaces.iter().find_map(|s| s.status.fatal())
    }

    /// Close every mailbox and join the threads
    pub fn shutdown(&mut self) {
        for space in &self.spaces {
            space.mailbox.close();
        }
        for space in self.spaces.iter_mut() {
            if let Some(join) = space.join.take() {
                match join.join() {
                    Ok(Ok(())) => log::debug!("Space: {} thread exited", space.name),
                    Ok(Err(e)) => log::warn!("Space: {} thread exited with: {}", space.name, e),
                    Err(_) => log::error!("Space: {} thread panicked", space.name),
                }
            }
        }
    }
}

impl MailboxDirectory for SpaceRegistry {
    fn mailbox_for(&self, space: &str) -> Option<Arc<Mailbox>> {
        self.find(space)
            .filter(|s| s.status.is_alive() && !s.mailbox.is_closed())
            .map(|s| Arc::clone(&s.mailbox))
    }

    fn mailboxes(&self) -> Vec<Arc<Mailbox>> {
        self.spaces.iter().map(|s| Arc::clone(&s.mailbox)).collect()
    }
}

impl Drop for SpaceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
