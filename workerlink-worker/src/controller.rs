// Response router: answers requests arriving on a bus with the real instance.
//
// One controller serves one connection. Each request is handled on its own
// task by default, so a slow async member never holds up the others.

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use workerlink_core::codec::to_payload;
use workerlink_core::msg::{AccessBody, CallBody, StreamBody};
use workerlink_core::remote::StreamSink;
use workerlink_core::{
    descriptor, AnnotationRegistry, Arg, CallArgs, Descriptor, ErrorCode, EventKind, InstanceConfig,
    RegistryError, Remote, RequestEnvelope, ResponseEnvelope, RpcError, StreamEvent,
    StreamMessage, SubscriptionKey,
};
use workerlink_transport::{MessageBus, TransportError};

use crate::config::WorkerConfig;
use crate::subscriptions::SubscriptionTable;

const RESPONSE_FALLBACK: &str = "Unable to serialize response from worker to client";
const STREAM_FALLBACK: &str = "Unable to serialize subscribable response from worker to client";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("remote type could not be declared: {0}")]
    Registry(#[from] RegistryError),
    #[error("worker instance could not be created: {0}")]
    Instance(#[from] RpcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("a tokio runtime is required to run a worker")]
    NoRuntime,
    #[error("worker thread could not be started: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WorkerError> for RpcError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Instance(err) => err,
            WorkerError::Transport(err) => err.into(),
            WorkerError::NoRuntime => RpcError::precondition(err.to_string()),
            other => RpcError::internal(other.to_string()),
        }
    }
}

pub struct WorkerController<T: Remote> {
    inner: Arc<RouterInner<T>>,
}

impl<T: Remote> Clone for WorkerController<T> {
    fn clone(&self) -> Self {
        WorkerController {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Remote> fmt::Debug for WorkerController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerController")
            .field("type", &self.inner.descriptor.type_name())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

struct RouterInner<T: Remote> {
    descriptor: Arc<Descriptor<T>>,
    instance: Arc<T>,
    bus: Arc<dyn MessageBus>,
    subscriptions: SubscriptionTable,
}

impl<T: Remote> WorkerController<T> {
    /// Builds the real instance and starts answering requests from `bus`.
    ///
    /// Must be called within a tokio runtime; handlers run on it.
    pub fn attach(bus: Arc<dyn MessageBus>, config: WorkerConfig) -> Result<Self, WorkerError> {
        let runtime = Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;
        let descriptor = descriptor::<T>()?;
        let instance = descriptor.create(InstanceConfig::real())?;

        let inner = Arc::new(RouterInner {
            descriptor,
            instance,
            bus: Arc::clone(&bus),
            subscriptions: SubscriptionTable::new(),
        });
        let weak = Arc::downgrade(&inner);

        if config.spawn_per_request {
            bus.set_onmessage(Arc::new(move |payload| {
                let Some(request) = parse_request(payload) else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    trace!("worker gone, dropping request");
                    return;
                };
                runtime.spawn(inner.route(request));
            }))?;
        } else {
            let (queue, pending) = mpsc::unbounded_channel::<RequestEnvelope>();
            runtime.spawn(drain_in_order(weak, pending));
            bus.set_onmessage(Arc::new(move |payload| {
                if let Some(request) = parse_request(payload) {
                    let _ = queue.send(request);
                }
            }))?;
        }

        debug!(
            type_name = inner.descriptor.type_name(),
            spawn_per_request = config.spawn_per_request,
            "worker controller attached"
        );
        Ok(WorkerController { inner })
    }

    /// The real instance requests are applied to.
    pub fn instance(&self) -> &Arc<T> {
        &self.inner.instance
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn remove_subscription(&self, key: &SubscriptionKey) -> bool {
        self.inner.subscriptions.remove(key)
    }

    pub fn remove_all_subscriptions(&self) {
        self.inner.subscriptions.remove_all();
    }

    /// Detaches every subscription and closes the bus.
    pub fn terminate(&self) {
        self.remove_all_subscriptions();
        self.inner.bus.terminate();
    }
}

fn parse_request(payload: Value) -> Option<RequestEnvelope> {
    match serde_json::from_value::<RequestEnvelope>(payload) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!(error = %e, "dropping payload that is not a request");
            None
        }
    }
}

async fn drain_in_order<T: Remote>(
    router: Weak<RouterInner<T>>,
    mut pending: mpsc::UnboundedReceiver<RequestEnvelope>,
) {
    while let Some(request) = pending.recv().await {
        let Some(inner) = router.upgrade() else {
            break;
        };
        inner.route(request).await;
    }
    trace!("worker request queue closed");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker handler panicked".to_string()
    }
}

fn post_envelope(bus: &dyn MessageBus, envelope: &ResponseEnvelope) -> Result<(), String> {
    let payload = to_payload(envelope).map_err(|e| e.message)?;
    bus.post_message(payload).map_err(|e| e.to_string())
}

fn member_name(request: &RequestEnvelope) -> Result<&str, RpcError> {
    request
        .property_name
        .as_deref()
        .ok_or_else(|| RpcError::bad_request("request names no member"))
}

impl<T: Remote> RouterInner<T> {
    async fn route(self: Arc<Self>, request: RequestEnvelope) {
        let outcome = AssertUnwindSafe(self.respond(&request)).catch_unwind().await;
        let response = match outcome {
            Ok(Ok(result)) => ResponseEnvelope::success(&request, result),
            Ok(Err(err)) => {
                debug!(secret = %request.request_secret, error = %err, "request failed");
                ResponseEnvelope::failure(&request, &err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(secret = %request.request_secret, panic = %message, "worker handler panicked");
                ResponseEnvelope::failure(&request, &RpcError::internal(message))
            }
        };
        self.post_response(&request, response);
    }

    async fn respond(&self, request: &RequestEnvelope) -> Result<Value, RpcError> {
        match request.kind {
            EventKind::Init => self.handle_init(request).await,
            EventKind::Callable => self.handle_call(request).await,
            EventKind::Accessable => self.handle_access(request),
            EventKind::Observable => self.handle_stream(request),
            EventKind::ObservableMessage => Err(RpcError::bad_request(
                "stream messages are not accepted as requests",
            )),
        }
    }

    fn post_response(&self, request: &RequestEnvelope, response: ResponseEnvelope) {
        if let Err(cause) = post_envelope(self.bus.as_ref(), &response) {
            warn!(secret = %request.request_secret, cause = %cause, "response could not be posted");
            let fallback = RpcError::with_data(
                ErrorCode::Dispatch,
                RESPONSE_FALLBACK,
                json!({ "cause": cause }),
            );
            let retry = post_envelope(self.bus.as_ref(), &ResponseEnvelope::failure(request, &fallback));
            if let Err(e) = retry {
                error!(secret = %request.request_secret, error = %e, "fallback response could not be posted");
            }
        }
    }

    #[tracing::instrument(skip(self, request), fields(secret = %request.request_secret))]
    async fn handle_init(&self, request: &RequestEnvelope) -> Result<Value, RpcError> {
        if let Some(hook) = self.descriptor.init_hook() {
            hook(Arc::clone(&self.instance)).await?;
            debug!("init hook completed");
        }
        Ok(Value::Null)
    }

    #[tracing::instrument(skip(self, request), fields(member = ?request.property_name))]
    async fn handle_call(&self, request: &RequestEnvelope) -> Result<Value, RpcError> {
        let name = member_name(request)?;
        let handler = self.descriptor.callable(name).ok_or_else(|| {
            RpcError::not_found(format!(
                "\"{}\" is not a callable member of {}",
                name,
                self.descriptor.type_name()
            ))
        })?;
        let body: CallBody = serde_json::from_value(request.body.clone())?;

        let tags: HashMap<usize, _> = AnnotationRegistry::global()
            .shallow_transfer_args(TypeId::of::<T>(), name)
            .into_iter()
            .map(|meta| (meta.arg_index, meta.tag))
            .collect();

        let mut args = Vec::with_capacity(body.arguments.len());
        for (index, value) in body.arguments.into_iter().enumerate() {
            match tags.get(&index) {
                Some(tag) => args.push(Arg::Revived(tag.revive(value)?)),
                None => args.push(Arg::Plain(value)),
            }
        }

        let handler = Arc::clone(handler);
        handler(Arc::clone(&self.instance), CallArgs::new(args)).await
    }

    #[tracing::instrument(skip(self, request), fields(member = ?request.property_name))]
    fn handle_access(&self, request: &RequestEnvelope) -> Result<Value, RpcError> {
        let name = member_name(request)?;
        let binding = self.descriptor.accessible(name).ok_or_else(|| {
            RpcError::not_found(format!(
                "\"{}\" is not an accessible member of {}",
                name,
                self.descriptor.type_name()
            ))
        })?;
        let meta = AnnotationRegistry::global().accessible(TypeId::of::<T>(), name);
        let body: AccessBody = serde_json::from_value(request.body.clone())?;

        if body.is_get {
            if meta.as_ref().is_some_and(|m| !m.allow_get) {
                return Err(RpcError::capability(format!(
                    "will not apply the get method to the \"{}\" property because the get accessor has been explicitly set to false",
                    name
                )));
            }
            return binding.read(&self.instance);
        }

        if meta.as_ref().is_some_and(|m| !m.allow_set) {
            return Err(RpcError::capability(format!(
                "will not apply the set method to the \"{}\" property because the set accessor has been explicitly set to false",
                name
            )));
        }
        let value = body.value.unwrap_or(Value::Null);
        let value = match meta.and_then(|m| m.shallow_transfer) {
            Some(tag) => Arg::Revived(tag.revive(value)?),
            None => Arg::Plain(value),
        };
        binding.write(&self.instance, value)?;
        Ok(Value::Null)
    }

    #[tracing::instrument(skip(self, request), fields(member = ?request.property_name))]
    fn handle_stream(&self, request: &RequestEnvelope) -> Result<Value, RpcError> {
        let name = member_name(request)?;
        let body: StreamBody = serde_json::from_value(request.body.clone())?;

        if body.is_unsubscribe {
            self.subscriptions.remove(&body.subscription_key);
            return Ok(Value::Null);
        }

        let binding = self.descriptor.streamable(name).ok_or_else(|| {
            RpcError::not_found(format!(
                "\"{}\" is not a streamable member of {}",
                name,
                self.descriptor.type_name()
            ))
        })?;

        self.subscriptions.remove(&body.subscription_key);
        let sink = stream_sink(Arc::clone(&self.bus), name.to_string(), body.subscription_key.clone());
        let subscription = binding.attach(&self.instance, sink);
        self.subscriptions.insert(body.subscription_key.clone(), subscription);
        debug!(key = %body.subscription_key, "subscription created");
        Ok(Value::String(body.subscription_key.as_str().to_string()))
    }
}

/// Forwards emitter events as unsolicited stream messages.
fn stream_sink(bus: Arc<dyn MessageBus>, member: String, key: SubscriptionKey) -> StreamSink {
    Arc::new(move |event: StreamEvent<Value>| {
        let message = match event {
            StreamEvent::Next(value) => StreamMessage::next(key.clone(), value),
            StreamEvent::Error(err) => StreamMessage::error(key.clone(), &err),
            StreamEvent::Complete => StreamMessage::complete(key.clone()),
        };
        let posted = ResponseEnvelope::stream(&member, &message)
            .map_err(|e| e.to_string())
            .and_then(|envelope| post_envelope(bus.as_ref(), &envelope));

        if let Err(cause) = posted {
            warn!(key = %key, cause = %cause, "stream message could not be posted");
            let fallback = StreamMessage::error(key.clone(), &RpcError::dispatch(STREAM_FALLBACK));
            let retry = ResponseEnvelope::stream(&member, &fallback)
                .map_err(|e| e.to_string())
                .and_then(|envelope| post_envelope(bus.as_ref(), &envelope));
            if let Err(e) = retry {
                error!(key = %key, error = %e, "fallback stream message could not be posted");
            }
        }
    })
}
