//! Request/response correlation.
//!
//! One resolver per outbound call id, each carrying the caller's deadline.
//! Resolvers fire exactly once: on the matching inbound response, when the
//! deadline passes and `expire` rejects and removes the entry, or when the
//! connection dies and every pending call is failed at once.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use serde_json::Value;
use tabrelay_core_types::{RelayError, RelayErrorKind};
use tokio::sync::oneshot;

pub type CallResult = Result<Value, RelayError>;

/// What happened to an inbound response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    /// Delivered to a waiting caller.
    Delivered,
    /// A resolver existed but the caller had already given up.
    Abandoned,
    /// No resolver registered for this id.
    Unmatched,
}

struct PendingEntry {
    responder: oneshot::Sender<CallResult>,
    deadline: Instant,
}

pub struct PendingCalls<K> {
    inflight: HashMap<K, PendingEntry>,
}

impl<K: Eq + Hash + Clone> PendingCalls<K> {
    pub fn new() -> Self {
        Self {
            inflight: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Register a resolver for `id`. Ids are unique per connection lifetime;
    /// a duplicate replaces (and thereby abandons) the previous resolver.
    pub fn register(&mut self, id: K, responder: oneshot::Sender<CallResult>, deadline: Instant) {
        self.inflight.insert(id, PendingEntry { responder, deadline });
    }

    /// Match an inbound response to its resolver and fire it at most once.
    pub fn resolve(&mut self, id: &K, result: CallResult) -> ResolveOutcome {
        match self.inflight.remove(id) {
            Some(entry) => match entry.responder.send(result) {
                Ok(()) => ResolveOutcome::Delivered,
                Err(_) => ResolveOutcome::Abandoned,
            },
            None => ResolveOutcome::Unmatched,
        }
    }

    /// Reject and remove every entry whose deadline has passed. A response
    /// arriving afterwards is unmatched, not delivered.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.inflight.remove(id) {
                let _ = entry.responder.send(Err(RelayError::new(RelayErrorKind::Timeout)
                    .with_hint("no response before the call deadline")));
            }
        }
        expired.len()
    }

    /// Fail everything in flight, e.g. when the connection closes.
    pub fn fail_all(&mut self, err: RelayError) -> usize {
        let count = self.inflight.len();
        for (_, entry) in self.inflight.drain() {
            let _ = entry.responder.send(Err(err.clone()));
        }
        count
    }
}

impl<K: Eq + Hash + Clone> Default for PendingCalls<K> {
    fn default() -> Self {
        Self::new()
    }
}
