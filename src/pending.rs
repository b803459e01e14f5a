//! Outstanding requests awaiting their correlated reply.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::AgentKind;

/// What a waiting caller eventually receives.
pub type CallOutcome = std::result::Result<Value, Error>;

/// Ids are only unique per source, so the source is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    /// Agent that issued the request.
    pub source: AgentKind,
    /// Request id.
    pub id: String,
}

impl CallKey {
    /// Create a key.
    pub fn new(source: AgentKind, id: impl Into<String>) -> Self {
        Self {
            source,
            id: id.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.id)
    }
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    /// Correlation key.
    pub key: CallKey,
    /// Agent the request was sent to.
    pub target: AgentKind,
    /// Method invoked.
    pub method: String,
    /// When the bus gives up on the call.
    pub deadline: Instant,
    /// When the call was registered.
    pub registered_at: Instant,
    slot: oneshot::Sender<CallOutcome>,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    /// Create a pending call and the receiver its caller waits on.
    pub fn new(
        key: CallKey,
        target: AgentKind,
        method: impl Into<String>,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<CallOutcome>) {
        let (slot, rx) = oneshot::channel();
        let call = Self {
            key,
            target,
            method: method.into(),
            deadline,
            registered_at: Instant::now(),
            slot,
            timer: None,
        };
        (call, rx)
    }

    /// Deliver the outcome, consuming the entry. Returns false if the caller
    /// is gone.
    pub fn resolve(self, outcome: CallOutcome) -> bool {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.slot.send(outcome).is_ok()
    }
}

/// Table of outstanding requests, owned by the bus.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: HashMap<CallKey, PendingCall>,
}

impl PendingCallTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call.
    pub fn insert(&mut self, call: PendingCall) -> Result<()> {
        if self.calls.contains_key(&call.key) {
            return Err(Error::InvalidState(format!(
                "request {} is already pending",
                call.key
            )));
        }
        self.calls.insert(call.key.clone(), call);
        Ok(())
    }

    /// Attach the deadline timer. A no-op if the call already completed.
    pub fn set_timer(&mut self, key: &CallKey, timer: AbortHandle) {
        match self.calls.get_mut(key) {
            Some(call) => call.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Remove a call. Whoever removes it owns its resolution.
    pub fn take(&mut self, key: &CallKey) -> Option<PendingCall> {
        self.calls.remove(key)
    }

    /// Remove every call issued by `source`.
    pub fn drain_source(&mut self, source: AgentKind) -> Vec<PendingCall> {
        let keys: Vec<CallKey> = self
            .calls
            .keys()
            .filter(|key| key.source == source)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.calls.remove(key)).collect()
    }

    /// Remove every call.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.calls.drain().map(|(_, call)| call).collect()
    }

    /// Whether a call is outstanding.
    pub fn contains(&self, key: &CallKey) -> bool {
        self.calls.contains_key(key)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
