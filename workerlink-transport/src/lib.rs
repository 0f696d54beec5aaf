pub mod bus;
pub mod channel;
pub mod codec;
pub mod loopback;
pub mod stream;

pub use bus::{HandlerSlot, MessageBus, MessageHandler, TransportError};
pub use channel::{channel_pair, ChannelBus};
pub use codec::{CodecError, EnvelopeCodec, FrameFormat, DEFAULT_MAX_FRAME_SIZE};
pub use loopback::{pair as loopback_pair, LoopbackBus};
pub use stream::StreamBus;
