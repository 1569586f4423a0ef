/// Mailbox between the app manager and one space thread
///
/// The manager enqueues control packets and signals once per batch. The space
/// thread drains the whole queue per wake-up and posts completions back.
use crate::protocol::{Command, Reply};

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Request from the manager, tagged with the token of the app it concerns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPacket {
    pub token: u64,
    pub command: Command,
}

impl ControlPacket {
    pub fn new(token: u64, command: Command) -> Self {
        Self { token, command }
    }
}

/// Outcome of a packet, posted back by the space thread
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub token: u64,
    pub command: &'static str,
    pub reply: Reply,
}

/// What a wake-up handed to the space thread
#[derive(Debug, Default)]
pub struct Batch {
    pub packets: Vec<ControlPacket>,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct Queues {
    tx: VecDeque<ControlPacket>,
    rx: VecDeque<Completion>,
    closed: bool,
}

#[derive(Debug)]
pub struct Mailbox {
    name: String,
    queues: Mutex<Queues>,
    has_work: Condvar,
}

impl Mailbox {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queues: Mutex::new(Queues::default()),
            has_work: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a packet without waking the space thread
    pub fn enqueue(&self, packet: ControlPacket) {
        self.lock().tx.push_back(packet);
    }

    /// Wake the space thread, the signal is raised under the lock
    pub fn notify(&self) {
        let _queues = self.lock();
        self.has_work.notify_one();
    }

    pub fn post(&self, packet: ControlPacket) {
        let mut queues = self.lock();
        queues.tx.push_back(packet);
        self.has_work.notify_one();
    }

    /// Wait until there is work or the mailbox is closed, at most `timeout`
    ///
    /// Drains every queued packet in one go.
    pub fn wait_for_work(&self, timeout: Duration) -> Batch {
        let queues = self.lock();
        let (mut queues, _) = self
            .has_work
            .wait_timeout_while(queues, timeout, |q| q.tx.is_empty() && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);

        Batch {
            packets: queues.tx.drain(..).collect(),
            closed: queues.closed,
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().tx.len()
    }

    pub fn push_completion(&self, completion: Completion) {
        self.lock().rx.push_back(completion);
    }

    pub fn take_completions(&self) -> Vec<Completion> {
        self.lock().rx.drain(..).collect()
    }

    /// Ask the space thread to tear the space down
    pub fn close(&self) {
        let mut queues = self.lock();
        queues.closed = true;
        self.has_work.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
