/// Outstanding requests of one space thread
use crate::protocol::{Reply, Response, SeqAllocator};

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionState {
    Wait,
    Done,
    Error,
}

/// A request sent to the space and waiting for (or holding) its response
#[derive(Clone, Debug)]
pub struct OutstandingRequest {
    pub seqno: i32,
    pub command: &'static str,
    pub params: String,
    /// Correlates the request with the mailbox packet it came from
    pub token: u64,
    pub state: ActionState,
    pub reply: Option<Reply>,
    pub sent_at: Instant,
    /// Already reported as overdue
    pub overdue: bool,
}

impl OutstandingRequest {
    pub fn new(seqno: i32, command: &'static str, params: String, token: u64) -> Self {
        Self {
            seqno,
            command,
            params,
            token,
            state: ActionState::Wait,
            reply: None,
            sent_at: Instant::now(),
            overdue: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ActionList {
    entries: Vec<OutstandingRequest>,
}

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn waiting(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ActionState::Wait)
            .count()
    }

    pub fn is_waiting(&self, seqno: i32) -> bool {
        self.find(seqno).is_some()
    }

    /// Next sequence number not used by a waiting request
    pub fn next_seqno(&self, seq: &mut SeqAllocator) -> i32 {
        loop {
            let seqno = seq.next_seqno();
            if !self.is_waiting(seqno) {
                return seqno;
            }
        }
    }

    pub fn insert(&mut self, request: OutstandingRequest) {
        self.entries.push(request);
    }

    /// Waiting request with this sequence number
    pub fn find(&self, seqno: i32) -> Option<&OutstandingRequest> {
        self.entries
            .iter()
            .find(|e| e.seqno == seqno && e.state == ActionState::Wait)
    }

    /// Record a response against the waiting request it answers
    ///
    /// Returns false when nothing is waiting on that sequence number.
    pub fn complete(&mut self, response: &Response) -> bool {
        let entry = match self
            .entries
            .iter_mut()
            .find(|e| e.seqno == response.seqno && e.state == ActionState::Wait)
        {
            Some(entry) => entry,
            None => return false,
        };

        entry.state = match response.reply {
            Reply::Uuid(_) => ActionState::Done,
            Reply::Error => ActionState::Error,
        };
        entry.reply = Some(response.reply.clone());
        true
    }

    /// Fail every waiting request, used when the space is gone
    pub fn fail_all(&mut self) -> usize {
        let mut failed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.state == ActionState::Wait) {
            entry.state = ActionState::Error;
            entry.reply = Some(Reply::Error);
            failed += 1;
        }
        failed
    }

    /// Waiting requests older than `limit` that were not reported yet
    ///
    /// Each request is returned at most once.
    pub fn take_overdue(&mut self, now: Instant, limit: Duration) -> Vec<OutstandingRequest> {
        let mut overdue = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.state == ActionState::Wait
                && !entry.overdue
                && now.saturating_duration_since(entry.sent_at) >= limit
            {
                entry.overdue = true;
                overdue.push(entry.clone());
            }
        }
        overdue
    }

    /// Remove and return all finished requests
    pub fn drain_finished(&mut self) -> Vec<OutstandingRequest> {
        let (finished, waiting): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.state != ActionState::Wait);
        self.entries = waiting;
        finished
    }
}
