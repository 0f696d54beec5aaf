use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Big-endian `u32` length, then the JSON text.
    #[default]
    LengthPrefixed,
    NewlineDelimited,
}

/// Frames envelopes as JSON over a byte stream.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    format: FrameFormat,
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            format: FrameFormat::LengthPrefixed,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn newline_delimited() -> Self {
        Self {
            format: FrameFormat::NewlineDelimited,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Serializes a payload and checks it against the frame limit.
    pub fn prepare(&self, payload: &Value) -> Result<Bytes, CodecError> {
        let json = serde_json::to_vec(payload).map_err(|e| CodecError::JsonError(e.to_string()))?;
        if json.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(json.len()));
        }
        Ok(Bytes::from(json))
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.format {
            FrameFormat::LengthPrefixed => {
                if src.len() < 4 {
                    return Ok(None);
                }

                let mut length_bytes = [0u8; 4];
                length_bytes.copy_from_slice(&src[..4]);
                let frame_len = u32::from_be_bytes(length_bytes) as usize;

                if frame_len > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge(frame_len));
                }

                if src.len() < 4 + frame_len {
                    src.reserve(4 + frame_len - src.len());
                    return Ok(None);
                }

                src.advance(4);
                src.split_to(frame_len)
            }
            FrameFormat::NewlineDelimited => match src.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if pos > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(pos));
                    }
                    let line = src.split_to(pos);
                    src.advance(1);
                    line
                }
                None => {
                    if src.len() > self.max_frame_size {
                        return Err(CodecError::FrameTooLarge(src.len()));
                    }
                    return Ok(None);
                }
            },
        };

        let payload =
            serde_json::from_slice(&frame).map_err(|e| CodecError::JsonError(e.to_string()))?;
        Ok(Some(payload))
    }
}

/// Writes an already serialized payload.
impl Encoder<Bytes> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(item.len()));
        }

        match self.format {
            FrameFormat::LengthPrefixed => {
                let length =
                    u32::try_from(item.len()).map_err(|_| CodecError::FrameTooLarge(item.len()))?;
                dst.reserve(4 + item.len());
                dst.put_u32(length);
                dst.put_slice(&item);
            }
            FrameFormat::NewlineDelimited => {
                dst.reserve(item.len() + 1);
                dst.put_slice(&item);
                dst.put_u8(b'\n');
            }
        }
        Ok(())
    }
}

impl Encoder<Value> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.prepare(&item)?;
        Encoder::<Bytes>::encode(self, frame, dst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_prefixed_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut buffer = BytesMut::new();
        let payload = json!({"requestSecret": "CLIENT_1", "type": 5, "propertyName": null, "body": null});

        codec.encode(payload.clone(), &mut buffer).unwrap();
        assert!(buffer.len() > 4);

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut buffer = BytesMut::new();
        buffer.put_u8(0);
        buffer.put_u8(0);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.put_u8(0);
        buffer.put_u8(10);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large_is_refused_both_ways() {
        let mut codec = EnvelopeCodec::new().with_max_frame_size(100);
        let mut buffer = BytesMut::new();
        let payload = json!("x".repeat(200));
        assert!(matches!(
            codec.encode(payload, &mut buffer),
            Err(CodecError::FrameTooLarge(_))
        ));

        buffer.put_u32(5000);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::FrameTooLarge(5000))
        ));
    }

    #[test]
    fn test_newline_delimited_multiple_frames() {
        let mut codec = EnvelopeCodec::newline_delimited();
        let mut buffer = BytesMut::new();
        codec.encode(json!({"a": 1}), &mut buffer).unwrap();
        codec.encode(json!("text with\\n escape"), &mut buffer).unwrap();
        assert_eq!(buffer[buffer.len() - 1], b'\n');

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), json!({"a": 1}));
        assert_eq!(
            codec.decode(&mut buffer).unwrap().unwrap(),
            json!("text with\\n escape")
        );
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_invalid_json_frame() {
        let mut codec = EnvelopeCodec::newline_delimited();
        let mut buffer = BytesMut::from(&b"{not json\n"[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::JsonError(_))
        ));
    }
}
