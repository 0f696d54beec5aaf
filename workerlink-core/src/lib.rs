pub mod codec;
pub mod emitter;
pub mod error;
pub mod gate;
pub mod keys;
pub mod msg;
pub mod registry;
pub mod remote;
pub mod transfer;

pub use codec::{structural_copy, to_payload};
pub use emitter::{Emitter, EventStream, Observable, Observer, StreamEvent, Subscription};
pub use error::{ErrorCode, RpcError};
pub use gate::{
    Accessible, CapabilityToken, Deferred, Gate, GateMode, Gated, InstanceConfig, MemberKind,
    Streamable, TokenPayload,
};
pub use keys::{
    generate_key, generate_unique_key, key_space_exhausted, CorrelationId, SecretRing, SubscriptionKey,
    CLIENT_PREFIX, MAX_KEY_ATTEMPTS, SECRET_LENGTH, SUBSCRIPTION_KEY_LENGTH,
};
pub use msg::{EventKind, Inbound, RequestEnvelope, ResponseEnvelope, StreamMessage, StreamMessageKind};
pub use registry::{Annotation, AnnotationRegistry, Category, RegistryError};
pub use remote::{descriptor, AccessOptions, CallOptions, Declaration, Descriptor, OnWorkerInit, Remote};
pub use transfer::{Arg, CallArgs, Transferable, TypeTag};

// Re-exported for `#[async_trait]` implementations of `OnWorkerInit`.
pub use async_trait::async_trait;
