use dashmap::DashMap;
use std::fmt;
use tokio::sync::oneshot;
use tracing::trace;
use workerlink_core::{CorrelationId, EventKind, ResponseEnvelope};

struct PendingCall {
    kind: EventKind,
    settle: oneshot::Sender<ResponseEnvelope>,
}

/// Correlation id to pending call.
///
/// An entry is removed exactly once: when its response arrives, when the
/// request fails locally, or when the table is cleared. Clearing drops the
/// senders, so whoever awaits them sees the channel close.
#[derive(Default)]
pub struct PendingTable {
    calls: DashMap<CorrelationId, PendingCall>,
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.calls.len())
            .finish()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the receiver its response settles.
    pub fn insert(&self, id: CorrelationId, kind: EventKind) -> oneshot::Receiver<ResponseEnvelope> {
        let (settle, receiver) = oneshot::channel();
        self.calls.insert(id, PendingCall { kind, settle });
        receiver
    }

    /// Hands `response` to the request with the same id and kind.
    ///
    /// Returns `false` when there is no such request, in which case the
    /// response is dropped.
    pub fn settle(&self, response: ResponseEnvelope) -> bool {
        let Some(id) = response.request_secret.clone() else {
            return false;
        };
        let kind = response.kind;
        match self.calls.remove_if(&id, |_, call| call.kind == kind) {
            Some((_, call)) => {
                // The awaiting side may have given up already.
                let _ = call.settle.send(response);
                true
            }
            None => {
                trace!(id = %id, kind = ?kind, "no pending request for response");
                false
            }
        }
    }

    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.calls.remove(id).is_some()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn clear(&self) {
        self.calls.clear();
    }
}
