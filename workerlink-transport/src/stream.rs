use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{HandlerSlot, MessageBus, MessageHandler, TransportError};
use crate::codec::EnvelopeCodec;

/// Bus over a byte stream such as child-process stdio or a socket.
#[derive(Debug)]
pub struct StreamBus {
    codec: EnvelopeCodec,
    outbound: mpsc::UnboundedSender<Bytes>,
    slot: Arc<HandlerSlot>,
    shutdown: CancellationToken,
}

impl StreamBus {
    /// Spawns the reader and writer tasks on the current runtime.
    pub fn spawn<R, W>(reader: R, writer: W, codec: EnvelopeCodec) -> Result<Self, TransportError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let (outbound, mut queued) = mpsc::unbounded_channel::<Bytes>();
        let slot = Arc::new(HandlerSlot::new());
        let shutdown = CancellationToken::new();

        let mut sink = FramedWrite::new(writer, codec.clone());
        let writer_shutdown = shutdown.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    next = queued.recv() => match next {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                warn!(error = %e, "stream bus write failed");
                                writer_shutdown.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = SinkExt::<Bytes>::close(&mut sink).await;
            debug!("stream bus writer stopped");
        });

        let mut frames = FramedRead::new(reader, codec.clone());
        let reader_slot = Arc::clone(&slot);
        let reader_shutdown = shutdown.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = frames.next() => match next {
                        Some(Ok(payload)) => reader_slot.deliver(payload),
                        Some(Err(e)) => {
                            warn!(error = %e, "stream bus read failed");
                            reader_shutdown.cancel();
                            break;
                        }
                        None => {
                            debug!("stream bus peer closed");
                            reader_shutdown.cancel();
                            break;
                        }
                    },
                }
            }
            reader_slot.clear();
        });

        Ok(StreamBus {
            codec,
            outbound,
            slot,
            shutdown,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl MessageBus for StreamBus {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = self.codec.prepare(&payload)?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        self.slot.install(handler);
        Ok(())
    }

    fn terminate(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use serde_json::json;
    use std::time::Duration;

    fn duplex_pair(codec: EnvelopeCodec) -> (StreamBus, StreamBus) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            StreamBus::spawn(left_read, left_write, codec.clone()).unwrap(),
            StreamBus::spawn(right_read, right_write, codec).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_payloads_cross_the_stream_in_order() {
        let (a, b) = duplex_pair(EnvelopeCodec::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        b.set_onmessage(Arc::new(move |v| {
            let _ = seen_tx.send(v);
        }))
        .unwrap();

        a.post_message(json!({"type": 5})).unwrap();
        a.post_message(json!({"type": 1})).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv()).await.unwrap();
        assert_eq!(first, Some(json!({"type": 5})));
        assert_eq!(second, Some(json!({"type": 1})));
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_synchronously() {
        let (a, _b) = duplex_pair(EnvelopeCodec::new().with_max_frame_size(32));
        let err = a.post_message(json!("y".repeat(64))).unwrap_err();
        assert!(matches!(err, TransportError::Codec(CodecError::FrameTooLarge(_))));
        assert!(!a.is_closed());
    }

    #[tokio::test]
    async fn test_peer_termination_closes_reader() {
        let (a, b) = duplex_pair(EnvelopeCodec::newline_delimited());
        a.terminate();
        tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .unwrap();
        assert!(b.post_message(json!(1)).is_err());
    }

    #[test]
    fn test_spawn_needs_a_runtime() {
        let (left, _right) = tokio::io::duplex(16);
        let (r, w) = tokio::io::split(left);
        assert!(matches!(
            StreamBus::spawn(r, w, EnvelopeCodec::new()),
            Err(TransportError::NoRuntime)
        ));
    }
}
