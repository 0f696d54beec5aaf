use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use workerlink_core::Remote;
use workerlink_transport::{loopback_pair, LoopbackBus, MessageBus, MessageHandler, TransportError};
use workerlink_worker::{WorkerConfig, WorkerController, WorkerError};

/// Caller end of an in-app worker.
///
/// Requests still travel as envelopes, so the worker behaves as it would on
/// another thread; with `mock_serialization` every payload is also deep-copied.
pub struct InAppWorker<T: Remote> {
    caller: LoopbackBus,
    controller: WorkerController<T>,
}

impl<T: Remote> fmt::Debug for InAppWorker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InAppWorker")
            .field("controller", &self.controller)
            .field("closed", &self.caller.is_closed())
            .finish()
    }
}

impl<T: Remote> InAppWorker<T> {
    /// Builds the real instance and attaches its router to a fresh loopback.
    pub fn start(mock_serialization: bool) -> Result<Self, WorkerError> {
        let (caller, worker) = loopback_pair(mock_serialization);
        let controller = WorkerController::attach(Arc::new(worker), WorkerConfig::default())?;
        debug!(mock_serialization, "in-app worker started");
        Ok(InAppWorker { caller, controller })
    }

    /// The real instance answering requests.
    pub fn instance(&self) -> &Arc<T> {
        self.controller.instance()
    }

    pub fn controller(&self) -> &WorkerController<T> {
        &self.controller
    }
}

impl<T: Remote> MessageBus for InAppWorker<T> {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        self.caller.post_message(payload)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        self.caller.set_onmessage(handler)
    }

    /// Nothing outlives the caller: the worker drops every stream
    /// subscription before the loopback closes.
    fn terminate(&self) {
        self.controller.remove_all_subscriptions();
        self.caller.terminate();
    }
}
