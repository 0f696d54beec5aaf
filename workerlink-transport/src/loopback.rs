use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use workerlink_core::structural_copy;

use crate::bus::{HandlerSlot, MessageBus, MessageHandler, TransportError};

#[derive(Debug)]
struct Link {
    ends: [HandlerSlot; 2],
    closed: AtomicBool,
    mock_serialization: bool,
}

#[derive(Debug, Clone)]
pub struct LoopbackBus {
    link: Arc<Link>,
    side: usize,
}

/// Two connected ends with synchronous delivery: `post_message` on one end
/// runs the other end's handler before returning. With `mock_serialization` every payload is copied
/// through its JSON text, the way a serializing channel would.
pub fn pair(mock_serialization: bool) -> (LoopbackBus, LoopbackBus) {
    let link = Arc::new(Link {
        ends: [HandlerSlot::new(), HandlerSlot::new()],
        closed: AtomicBool::new(false),
        mock_serialization,
    });
    (
        LoopbackBus {
            link: Arc::clone(&link),
            side: 0,
        },
        LoopbackBus { link, side: 1 },
    )
}

impl LoopbackBus {
    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::Acquire)
    }
}

impl MessageBus for LoopbackBus {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let payload = if self.link.mock_serialization {
            structural_copy(&payload).map_err(|e| TransportError::Serialize(e.message))?
        } else {
            payload
        };
        trace!(side = self.side, "loopback delivering payload");
        self.link.ends[1 - self.side].deliver(payload);
        Ok(())
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        self.link.ends[self.side].install(handler);
        Ok(())
    }

    fn terminate(&self) {
        if !self.link.closed.swap(true, Ordering::AcqRel) {
            debug!("loopback bus terminated");
        }
        for end in &self.link.ends {
            end.clear();
        }
    }
}
