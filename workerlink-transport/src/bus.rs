use serde_json::Value;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use workerlink_core::RpcError;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Payload cannot be copied: {0}")]
    Serialize(String),
    #[error("No tokio runtime available to drive the bus")]
    NoRuntime,
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::dispatch(err.to_string())
    }
}

/// Inbound callback installed by the side that owns the bus end.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// The two-method contract every transport implements.
///
/// `post_message` must fail synchronously when the payload cannot be handed
/// to the other side. The handler is invoked once per inbound payload, in
/// arrival order.
pub trait MessageBus: Send + Sync {
    fn post_message(&self, payload: Value) -> Result<(), TransportError>;

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError>;

    /// Closes the bus. Later posts fail with `ConnectionClosed`.
    fn terminate(&self) {}
}

impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        (**self).post_message(payload)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        (**self).set_onmessage(handler)
    }

    fn terminate(&self) {
        (**self).terminate()
    }
}

#[derive(Default)]
struct SlotState {
    handler: Option<MessageHandler>,
    backlog: Vec<Value>,
}

/// Holds the inbound handler of one bus end.
///
/// Payloads arriving before a handler is installed are kept and replayed,
/// in order, when it is. The handler always runs with no lock held.
#[derive(Default)]
pub struct HandlerSlot {
    state: Mutex<SlotState>,
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandlerSlot")
            .field("installed", &state.handler.is_some())
            .field("backlog", &state.backlog.len())
            .finish()
    }
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, handler: MessageHandler) {
        let backlog = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.handler = Some(Arc::clone(&handler));
            std::mem::take(&mut state.backlog)
        };
        for payload in backlog {
            handler(payload);
        }
    }

    pub fn deliver(&self, payload: Value) {
        let handler = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &state.handler {
                Some(handler) => Arc::clone(handler),
                None => {
                    state.backlog.push(payload);
                    return;
                }
            }
        };
        handler(payload);
    }

    /// Drops the handler and anything still queued.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handler = None;
        state.backlog.clear();
    }

    pub fn is_installed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handler
            .is_some()
    }
}
