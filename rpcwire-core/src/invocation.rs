//! Outstanding twoway invocations.
//!
//! The table owns every in-flight invocation of a connection, keyed by
//! request id. Completing, canceling or failing an invocation removes it,
//! so a result is delivered at most once.

use crate::error::LocalError;
use rpcwire_protocol::{Encapsulation, OperationMode, ReplyBody};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::oneshot;

/// Result of a twoway invocation that reached the servant.
///
/// A user exception is still a response; `ok` is false and `params`
/// holds the marshaled exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
    pub params: Encapsulation,
}

impl Response {
    /// Maps a reply body to a response, or to the local error its status
    /// stands for.
    pub fn from_reply(body: ReplyBody) -> Result<Self, LocalError> {
        match body {
            ReplyBody::Ok(params) => Ok(Response { ok: true, params }),
            ReplyBody::UserException(params) => Ok(Response { ok: false, params }),
            ReplyBody::ObjectNotExist(info) => Err(LocalError::ObjectNotExist(info)),
            ReplyBody::FacetNotExist(info) => Err(LocalError::FacetNotExist(info)),
            ReplyBody::OperationNotExist(info) => Err(LocalError::OperationNotExist(info)),
            ReplyBody::UnknownLocalException(s) => Err(LocalError::UnknownLocalException(s)),
            ReplyBody::UnknownUserException(s) => Err(LocalError::UnknownUserException(s)),
            ReplyBody::UnknownException(s) => Err(LocalError::UnknownException(s)),
        }
    }
}

/// A failed attempt. `sent` records whether the request bytes may have
/// reached the transport, which decides whether a retry is safe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct InvocationFailure {
    pub error: LocalError,
    pub sent: bool,
}

impl InvocationFailure {
    pub fn unsent(error: LocalError) -> Self {
        Self { error, sent: false }
    }

    pub fn sent(error: LocalError) -> Self {
        Self { error, sent: true }
    }
}

pub type InvocationResult = Result<Response, InvocationFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Queued, no byte written yet.
    Pending,
    /// Handed to the transport.
    Sent,
    Completed,
}

/// A twoway request waiting for its reply.
#[derive(Debug)]
pub struct OutstandingInvocation {
    pub request_id: i32,
    pub operation: String,
    pub mode: OperationMode,
    pub state: InvocationState,
    reply: oneshot::Sender<InvocationResult>,
}

impl OutstandingInvocation {
    pub fn new(
        request_id: i32,
        operation: impl Into<String>,
        mode: OperationMode,
    ) -> (Self, oneshot::Receiver<InvocationResult>) {
        let (tx, rx) = oneshot::channel();
        let invocation = Self {
            request_id,
            operation: operation.into(),
            mode,
            state: InvocationState::Pending,
            reply: tx,
        };
        (invocation, rx)
    }

    fn finish(mut self, result: InvocationResult) {
        self.state = InvocationState::Completed;
        // The waiter may have gone away; nothing left to do then.
        let _ = self.reply.send(result);
    }
}

/// What happened to a reply handed to [`InvocationTable::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// Late reply for a canceled invocation.
    Discarded,
    /// No invocation with that id.
    Unknown,
}

/// Most canceled-after-send ids remembered per connection. Past this the
/// oldest is forgotten and a reply for it counts as unknown.
pub const DISCARDED_LIMIT: usize = 1024;

/// Outstanding invocations of one connection.
#[derive(Debug)]
pub struct InvocationTable {
    entries: HashMap<i32, OutstandingInvocation>,
    /// Ids canceled after their request was sent. A reply may still come.
    discarded: HashSet<i32>,
    /// `discarded` in cancellation order.
    discard_order: VecDeque<i32>,
    next_id: i32,
}

impl Default for InvocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            discarded: HashSet::new(),
            discard_order: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Returns the next free request id.
    ///
    /// Ids are positive, wrap to 1 after `i32::MAX` and skip ids that are
    /// outstanding or whose late reply is still expected.
    pub fn next_request_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) && !self.discarded.contains(&id) {
                return id;
            }
        }
    }

    /// Adds an invocation. Returns `false`, leaving the table unchanged, if
    /// the id is already taken.
    pub fn register(&mut self, invocation: OutstandingInvocation) -> bool {
        let id = invocation.request_id;
        if self.entries.contains_key(&id) || self.discarded.contains(&id) {
            return false;
        }
        self.entries.insert(id, invocation);
        true
    }

    pub fn mark_sent(&mut self, request_id: i32) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.state = InvocationState::Sent;
        }
    }

    pub fn state(&self, request_id: i32) -> Option<InvocationState> {
        self.entries.get(&request_id).map(|e| e.state)
    }

    pub fn contains(&self, request_id: i32) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delivers a result to the invocation and removes it.
    pub fn complete(&mut self, request_id: i32, result: InvocationResult) -> Completion {
        if let Some(entry) = self.entries.remove(&request_id) {
            entry.finish(result);
            Completion::Delivered
        } else if self.discarded.remove(&request_id) {
            self.discard_order.retain(|id| *id != request_id);
            Completion::Discarded
        } else {
            Completion::Unknown
        }
    }

    /// Fails the invocation locally with `reason`.
    ///
    /// Returns the state it was in, or `None` if it was not outstanding.
    /// A canceled sent invocation leaves its id reserved until the late
    /// reply arrives.
    pub fn cancel(&mut self, request_id: i32, reason: LocalError) -> Option<InvocationState> {
        let entry = self.entries.remove(&request_id)?;
        let state = entry.state;
        let sent = state == InvocationState::Sent;
        if sent {
            self.discard(request_id);
        }
        entry.finish(Err(InvocationFailure {
            error: reason,
            sent,
        }));
        Some(state)
    }

    fn discard(&mut self, request_id: i32) {
        if self.discarded.len() >= DISCARDED_LIMIT {
            if let Some(oldest) = self.discard_order.pop_front() {
                self.discarded.remove(&oldest);
            }
        }
        self.discarded.insert(request_id);
        self.discard_order.push_back(request_id);
    }

    /// Number of ids whose late reply is still expected.
    pub fn discarded(&self) -> usize {
        self.discarded.len()
    }

    /// Fails every outstanding invocation with `error`.
    pub fn fail_all(&mut self, error: &LocalError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let sent = entry.state == InvocationState::Sent;
            entry.finish(Err(InvocationFailure {
                error: error.clone(),
                sent,
            }));
        }
        self.discarded.clear();
        self.discard_order.clear();
        count
    }
}
