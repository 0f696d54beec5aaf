use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bus::{HandlerSlot, MessageBus, MessageHandler, TransportError};

#[derive(Debug)]
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<Value>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    slot: Arc<HandlerSlot>,
    shutdown: CancellationToken,
}

/// Two ends over unbounded channels. Each end pumps its inbound channel on
/// the runtime that installs its handler.
pub fn channel_pair() -> (ChannelBus, ChannelBus) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    (
        ChannelBus::new(a_tx, b_rx, shutdown.clone()),
        ChannelBus::new(b_tx, a_rx, shutdown),
    )
}

impl ChannelBus {
    fn new(
        tx: mpsc::UnboundedSender<Value>,
        rx: mpsc::UnboundedReceiver<Value>,
        shutdown: CancellationToken,
    ) -> Self {
        ChannelBus {
            tx,
            rx: Mutex::new(Some(rx)),
            slot: Arc::new(HandlerSlot::new()),
            shutdown,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once either end terminates.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<Value>, handle: Handle) {
        let slot = Arc::clone(&self.slot);
        let shutdown = self.shutdown.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(payload) => slot.deliver(payload),
                        None => break,
                    },
                }
            }
            slot.clear();
            debug!("channel bus pump stopped");
        });
    }
}

impl MessageBus for ChannelBus {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        trace!("channel bus posting payload");
        self.tx
            .send(payload)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        let pending = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(rx) = pending {
            let handle = match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    *self.rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
                    return Err(TransportError::NoRuntime);
                }
            };
            self.spawn_pump(rx, handle);
        }
        self.slot.install(handler);
        Ok(())
    }

    fn terminate(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("channel bus terminated");
            self.shutdown.cancel();
        }
    }
}
