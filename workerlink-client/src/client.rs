// Worker client: owns the proxy instance and the caller end of the bus.
//
// Every operation goes through the request dispatcher. A gated member of the
// proxy yields a capability token, the token is validated, turned into a
// request envelope and posted; the matching response settles the future.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, trace, warn};
use workerlink_core::msg::{AccessBody, CallBody, StreamBody};
use workerlink_core::{
    descriptor, AnnotationRegistry, CapabilityToken, CorrelationId, Deferred, Descriptor, Emitter,
    ErrorCode, EventKind, Gated, Inbound, InstanceConfig, MemberKind, Observer, Remote,
    RequestEnvelope, RpcError, SecretRing, SubscriptionKey, TokenPayload, CLIENT_PREFIX,
};
use workerlink_transport::MessageBus;

use crate::config::ClientConfig;
use crate::in_app::InAppWorker;
use crate::manager::WorkerDefinition;
use crate::pending::PendingTable;
use crate::streams::{RemoteObservable, RemoteSubscription, StreamHandle, StreamTable};

const NOT_CONNECTED: &str =
    "the WorkerClient.connect() method must be called before a worker can be accessed";
const REQUEST_UNENCODABLE: &str = "Unable to serialize the request from the client to the worker";

/// Where the dispatcher finds the capability token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenSource {
    /// Whatever a gated member of the proxy handed back.
    Selected(Option<CapabilityToken>),
    /// An accessible or streamable member, read from the proxy by name.
    Named(String),
}

type Check = Box<dyn Fn(&CapabilityToken) -> bool + Send>;
type Rejection = Box<dyn Fn(&CapabilityToken) -> String + Send>;
type BeforeSend<C> = Box<dyn FnOnce(&CapabilityToken) -> Result<C, RpcError> + Send>;
type BodyFn<C> = Box<dyn FnOnce(&CapabilityToken, &C) -> Result<Value, RpcError> + Send>;
type MapResult<C, R> = Box<dyn FnOnce(Value, C) -> Result<R, RpcError> + Send>;
type Cleanup<C> = Box<dyn FnOnce(&RpcError, C) + Send>;

/// One member request, from token to typed result.
///
/// `C` is whatever the pre-send hook produced; the body, the result mapping
/// and the cleanup hook all see it.
pub struct RequestOptions<C, R> {
    kind: MemberKind,
    operation: &'static str,
    token: TokenSource,
    checks: Vec<(Check, Rejection)>,
    before_send: BeforeSend<C>,
    body: BodyFn<C>,
    map_result: MapResult<C, R>,
    cleanup: Option<Cleanup<C>>,
}

impl<C, R> fmt::Debug for RequestOptions<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("kind", &self.kind)
            .field("operation", &self.operation)
            .field("token", &self.token)
            .field("checks", &self.checks.len())
            .finish()
    }
}

impl<C, R> RequestOptions<C, R> {
    pub fn new<B, F, M>(
        kind: MemberKind,
        operation: &'static str,
        token: TokenSource,
        before_send: B,
        body: F,
        map_result: M,
    ) -> Self
    where
        B: FnOnce(&CapabilityToken) -> Result<C, RpcError> + Send + 'static,
        F: FnOnce(&CapabilityToken, &C) -> Result<Value, RpcError> + Send + 'static,
        M: FnOnce(Value, C) -> Result<R, RpcError> + Send + 'static,
    {
        RequestOptions {
            kind,
            operation,
            token,
            checks: Vec::new(),
            before_send: Box::new(before_send),
            body: Box::new(body),
            map_result: Box::new(map_result),
            cleanup: None,
        }
    }

    /// Adds a predicate; checks run in order and the first failure rejects
    /// with its message before anything is sent.
    pub fn require<P, M>(mut self, check: P, rejection: M) -> Self
    where
        P: Fn(&CapabilityToken) -> bool + Send + 'static,
        M: Fn(&CapabilityToken) -> String + Send + 'static,
    {
        self.checks.push((Box::new(check), Box::new(rejection)));
        self
    }

    /// Runs when the request fails after the pre-send hook.
    pub fn on_error<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(&RpcError, C) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

struct Connection<T: Remote> {
    descriptor: Arc<Descriptor<T>>,
    proxy: Arc<T>,
    proxy_secret: String,
    bus: Arc<dyn MessageBus>,
    in_app: Option<Arc<InAppWorker<T>>>,
}

impl<T: Remote> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Connection {
            descriptor: Arc::clone(&self.descriptor),
            proxy: Arc::clone(&self.proxy),
            proxy_secret: self.proxy_secret.clone(),
            bus: Arc::clone(&self.bus),
            in_app: self.in_app.clone(),
        }
    }
}

struct ClientInner<T: Remote> {
    definition: WorkerDefinition<T>,
    config: ClientConfig,
    lifecycle: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Connection<T>>>,
    connected: AtomicBool,
    secrets: Mutex<SecretRing>,
    pending: PendingTable,
    streams: StreamTable,
}

impl<T: Remote> ClientInner<T> {
    fn lock_secrets(&self) -> MutexGuard<'_, SecretRing> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self, during_connect: bool) -> Result<Connection<T>, RpcError> {
        if !during_connect && !self.connected.load(Ordering::Acquire) {
            return Err(RpcError::precondition(NOT_CONNECTED));
        }
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RpcError::precondition(NOT_CONNECTED))
    }

    /// Inbound handler installed on the bus.
    fn receive(&self, payload: Value) {
        match Inbound::from_value(payload) {
            Ok(Inbound::Response(response)) => {
                let issued = response
                    .request_secret
                    .as_ref()
                    .is_some_and(|id| self.lock_secrets().was_issued(id.as_str()));
                if !issued {
                    trace!(id = ?response.request_secret, "response to a secret this session never issued ignored");
                    return;
                }
                if self.pending.settle(response) {
                    trace!("response matched");
                }
            }
            Ok(Inbound::Stream { member, message }) => {
                trace!(member = ?member, key = %message.key, kind = ?message.kind, "stream message received");
                self.streams.dispatch(message);
            }
            Err(e) => warn!(error = %e, "unrecognised payload from worker ignored"),
        }
    }

    /// Drops every caller-side table and terminates the bus. Pending futures
    /// observe a closed channel.
    fn teardown(&self) -> bool {
        self.connected.store(false, Ordering::Release);
        let connection = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.streams.clear();
        self.pending.clear();
        self.lock_secrets().clear();
        match connection {
            Some(connection) => {
                connection.bus.terminate();
                true
            }
            None => false,
        }
    }
}

impl<T: Remote> Drop for ClientInner<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Removes a request's bookkeeping however its future ends.
struct Outstanding<'a, T: Remote> {
    inner: &'a ClientInner<T>,
    id: CorrelationId,
}

impl<T: Remote> Drop for Outstanding<'_, T> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
        self.inner.lock_secrets().revoke(self.id.as_str());
    }
}

/// Caller-side handle to a worker hosting `T`. Cheap to clone; clones share
/// one connection.
pub struct WorkerClient<T: Remote> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Remote> Clone for WorkerClient<T> {
    fn clone(&self) -> Self {
        WorkerClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Remote> fmt::Debug for WorkerClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClient")
            .field("target", &std::any::type_name::<T>())
            .field("connected", &self.is_connected())
            .field("pending", &self.inner.pending.len())
            .field("streams", &self.inner.streams.len())
            .finish()
    }
}

impl<T: Remote> WorkerClient<T> {
    pub fn new(definition: WorkerDefinition<T>, config: ClientConfig) -> Self {
        let secrets = SecretRing::with_length(config.secret_length);
        let streams = StreamTable::new(config.subscription_key_length);
        WorkerClient {
            inner: Arc::new(ClientInner {
                definition,
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                connection: RwLock::new(None),
                connected: AtomicBool::new(false),
                secrets: Mutex::new(secrets),
                pending: PendingTable::new(),
                streams,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Builds the proxy, opens the bus and waits for the worker's init
    /// hook. Does nothing when already connected.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let descriptor = descriptor::<T>()?;
        let proxy_secret = {
            let mut secrets = self.inner.lock_secrets();
            secrets.clear();
            secrets.issue(Some(CLIENT_PREFIX))?
        };
        let proxy = descriptor.create(InstanceConfig::proxy(proxy_secret.clone()))?;

        let (bus, in_app) = if self.inner.config.run_in_app {
            let worker = Arc::new(InAppWorker::<T>::start(self.inner.config.mock_serialization)?);
            (Arc::clone(&worker) as Arc<dyn MessageBus>, Some(worker))
        } else {
            (self.inner.definition.open()?, None)
        };

        let weak = Arc::downgrade(&self.inner);
        bus.set_onmessage(Arc::new(move |payload| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(payload);
            }
        }))?;

        let connection = Connection {
            descriptor,
            proxy,
            proxy_secret,
            bus,
            in_app,
        };
        *self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection.clone());
        debug!(
            target_type = std::any::type_name::<T>(),
            in_app = self.inner.config.run_in_app,
            "bus open, sending init"
        );

        match self.exchange(&connection, EventKind::Init, None, Value::Null).await {
            Ok(_) => {
                self.inner.connected.store(true, Ordering::Release);
                debug!(target_type = std::any::type_name::<T>(), "worker client connected");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "worker init failed");
                self.inner.teardown();
                Err(err)
            }
        }
    }

    /// Terminates the worker and forgets every request and subscription.
    /// The client can connect again afterwards.
    pub async fn destroy(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.teardown() {
            debug!(target_type = std::any::type_name::<T>(), "worker client destroyed");
        }
    }

    /// The real instance, when the worker runs in-app.
    pub fn in_app_instance(&self) -> Option<Arc<T>> {
        let connection = self.inner.connection(false).ok()?;
        connection
            .in_app
            .as_ref()
            .map(|worker| Arc::clone(worker.instance()))
    }

    /// Validates a token and runs one request through the bus.
    pub async fn send_request<C, R>(&self, options: RequestOptions<C, R>) -> Result<R, RpcError>
    where
        C: Send,
        R: Send,
    {
        let connection = self.inner.connection(false)?;
        let RequestOptions {
            kind,
            operation,
            token,
            checks,
            before_send,
            body,
            map_result,
            cleanup,
        } = options;

        let token = match token {
            TokenSource::Selected(token) => token,
            TokenSource::Named(name) => connection.descriptor.probe(&connection.proxy, &name),
        }
        .filter(|token| token.verify(&connection.proxy_secret, kind))
        .ok_or_else(|| {
            RpcError::capability(format!(
                "only members declared {kind} can be used with {operation}"
            ))
        })?;

        for (check, rejection) in &checks {
            if !check(&token) {
                return Err(RpcError::capability(rejection(&token)));
            }
        }
        drop(checks);

        let context = before_send(&token)?;
        let outcome = match body(&token, &context) {
            Ok(body) => {
                self.exchange(&connection, kind.event_kind(), Some(token.member.clone()), body)
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(value) => map_result(value, context),
            Err(err) => {
                if let Some(cleanup) = cleanup {
                    cleanup(&err, context);
                }
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        connection: &Connection<T>,
        kind: EventKind,
        member: Option<String>,
        body: Value,
    ) -> Result<Value, RpcError> {
        let id = CorrelationId::new(self.inner.lock_secrets().issue(Some(CLIENT_PREFIX))?);
        let outstanding = Outstanding {
            inner: &self.inner,
            id: id.clone(),
        };

        let request = RequestEnvelope {
            request_secret: id.clone(),
            property_name: member,
            kind,
            body,
        };
        let payload = serde_json::to_value(&request).map_err(|e| unencodable(&e))?;
        let response = self.inner.pending.insert(id.clone(), kind);
        connection.bus.post_message(payload).map_err(|e| {
            warn!(id = %id, error = %e, "request could not be posted");
            unencodable(&e)
        })?;
        trace!(id = %id, kind = ?kind, member = ?request.property_name, "request sent");

        let settled = match self.inner.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, response).await.map_err(|_| {
                RpcError::timeout(format!("the worker did not respond within {limit:?}"))
            })?,
            None => response.await,
        };
        drop(outstanding);

        let response = settled.map_err(|_| {
            RpcError::canceled("the connection was destroyed before the worker responded")
        })?;
        match response.remote_error() {
            Some(err) => {
                debug!(id = %id, error = %err, "request rejected by worker");
                Err(err)
            }
            None => Ok(response.result),
        }
    }

    fn select<V>(&self, select: impl FnOnce(&T) -> Gated<V>) -> Result<TokenSource, RpcError> {
        let connection = self.inner.connection(false)?;
        Ok(TokenSource::Selected(select(&connection.proxy).into_token()))
    }

    /// Reads an accessible member of the worker's instance.
    pub async fn get<V, F>(&self, select: F) -> Result<V, RpcError>
    where
        F: FnOnce(&T) -> Gated<V> + Send,
        V: DeserializeOwned + Send + 'static,
    {
        let token = self.select(select)?;
        let options = RequestOptions::new(
            MemberKind::Access,
            "get",
            token,
            |token| {
                Ok(AnnotationRegistry::global()
                    .accessible(TypeId::of::<T>(), &token.member)
                    .and_then(|meta| meta.shallow_transfer))
            },
            |_, _| {
                encode_body(&AccessBody {
                    is_get: true,
                    value: None,
                })
            },
            |value, tag| match tag {
                Some(tag) => tag.revive_as::<V>(value),
                None => Ok(serde_json::from_value(value)?),
            },
        )
        .require(
            |token| matches!(token.payload, TokenPayload::Access { get: true, .. }),
            |token| {
                format!(
                    "will not apply the get method to the \"{}\" property because the get accessor has been explicitly set to false",
                    token.member
                )
            },
        );
        self.send_request(options).await
    }

    /// Writes an accessible member of the worker's instance.
    pub async fn set<V, F>(&self, select: F, value: V) -> Result<(), RpcError>
    where
        F: FnOnce(&T) -> Gated<V> + Send,
        V: Serialize + Send + 'static,
    {
        let token = self.select(select)?;
        let options = RequestOptions::new(
            MemberKind::Access,
            "set",
            token,
            |_| Ok(()),
            move |_, _| {
                let value = serde_json::to_value(&value).map_err(|e| unencodable(&e))?;
                encode_body(&AccessBody {
                    is_get: false,
                    value: Some(value),
                })
            },
            |_, _| Ok(()),
        )
        .require(
            |token| matches!(token.payload, TokenPayload::Access { set: true, .. }),
            |token| {
                format!(
                    "will not apply the set method to the \"{}\" property because the set accessor has been explicitly set to false",
                    token.member
                )
            },
        );
        self.send_request(options).await
    }

    /// Calls a synchronous callable: `client.call(|w| w.add(2, 3))`.
    pub async fn call<R, F>(&self, select: F) -> Result<R, RpcError>
    where
        F: FnOnce(&T) -> Gated<R> + Send,
        R: DeserializeOwned + Send + 'static,
    {
        let token = self.select(select)?;
        self.call_with(token).await
    }

    /// Calls a callable whose real body is asynchronous.
    pub async fn call_async<R, F>(&self, select: F) -> Result<R, RpcError>
    where
        F: FnOnce(&T) -> Gated<Deferred<R>> + Send,
        R: DeserializeOwned + Send + 'static,
    {
        let token = self.select(select)?;
        self.call_with(token).await
    }

    async fn call_with<R>(&self, token: TokenSource) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let options = RequestOptions::new(
            MemberKind::Call,
            "call",
            token,
            |token| {
                Ok(AnnotationRegistry::global()
                    .callable(TypeId::of::<T>(), &token.member)
                    .and_then(|meta| meta.shallow_transfer_return))
            },
            |token, _| match &token.payload {
                TokenPayload::Call { args } => encode_body(&CallBody {
                    arguments: args.clone(),
                }),
                TokenPayload::Unencodable { reason } => Err(RpcError::with_data(
                    ErrorCode::Dispatch,
                    REQUEST_UNENCODABLE,
                    json!({ "cause": reason }),
                )),
                _ => Err(RpcError::capability(
                    "only members declared callable can be used with call",
                )),
            },
            |value, tag| match tag {
                Some(tag) => tag.revive_as::<R>(value),
                None => Ok(serde_json::from_value(value)?),
            },
        )
        .require(
            |token| {
                AnnotationRegistry::global()
                    .callable(TypeId::of::<T>(), &token.member)
                    .is_none_or(|meta| !(meta.return_is_async && meta.shallow_transfer_return.is_some()))
            },
            |token| {
                format!(
                    "shallow transfer cannot be applied to the deferred result of \"{}\"",
                    token.member
                )
            },
        );
        self.send_request(options).await
    }

    /// Subscribes to a streamable member. Events reach `observer` until
    /// [`unsubscribe`](Self::unsubscribe) or the stream ends.
    pub async fn subscribe<V, F>(&self, select: F, observer: Observer<V>) -> Result<RemoteSubscription, RpcError>
    where
        F: FnOnce(&T) -> Gated<Emitter<V>> + Send,
        V: DeserializeOwned + Clone + Send + 'static,
    {
        let token = self.select(select)?;
        let inner = Arc::clone(&self.inner);
        let cleanup_inner = Arc::clone(&self.inner);
        let options = RequestOptions::new(
            MemberKind::Stream,
            "subscribe",
            token,
            move |token| {
                let emitter = Emitter::new();
                let local = emitter.subscribe(observer);
                match inner.streams.register(&token.member, emitter) {
                    Ok(registration) => Ok((registration, local)),
                    Err(err) => {
                        local.unsubscribe();
                        Err(err)
                    }
                }
            },
            |_, (registration, _)| stream_body(false, &registration.key),
            |_, (registration, local)| Ok(RemoteSubscription::new(registration, local)),
        )
        .on_error(move |_, (registration, local)| {
            cleanup_inner
                .streams
                .remove(&registration.key, registration.local_id);
            local.unsubscribe();
        });
        self.send_request(options).await
    }

    /// Like [`subscribe`](Self::subscribe), but hands back a view to attach
    /// observers to later.
    pub async fn observe<V, F>(&self, select: F) -> Result<RemoteObservable<V>, RpcError>
    where
        F: FnOnce(&T) -> Gated<Emitter<V>> + Send,
        V: DeserializeOwned + Send + 'static,
    {
        let token = self.select(select)?;
        let inner = Arc::clone(&self.inner);
        let cleanup_inner = Arc::clone(&self.inner);
        let options = RequestOptions::new(
            MemberKind::Stream,
            "observe",
            token,
            move |token| {
                let emitter = Emitter::new();
                let observable = emitter.as_observable();
                let registration = inner.streams.register(&token.member, emitter)?;
                Ok((registration, observable))
            },
            |_, (registration, _)| stream_body(false, &registration.key),
            |_, (registration, observable)| Ok(RemoteObservable::new(registration, observable)),
        )
        .on_error(move |_, (registration, _)| {
            cleanup_inner
                .streams
                .remove(&registration.key, registration.local_id);
        });
        self.send_request(options).await
    }

    /// Stops a remote subscription. Handles that are unknown or already
    /// unsubscribed resolve immediately without a message.
    pub async fn unsubscribe<H>(&self, handle: &H) -> Result<(), RpcError>
    where
        H: StreamHandle + Sync,
    {
        handle.release();
        let Some(member) = self.inner.streams.remove(handle.key(), handle.local_id()) else {
            trace!(key = %handle.key(), "unsubscribe for an inactive handle ignored");
            return Ok(());
        };
        debug!(key = %handle.key(), member = %member, "remote subscription removed");

        let key = handle.key().clone();
        let options = RequestOptions::new(
            MemberKind::Stream,
            "unsubscribe",
            TokenSource::Named(member),
            |_| Ok(()),
            move |_, _| stream_body(true, &key),
            |_, _| Ok(()),
        );
        self.send_request(options).await
    }

    /// Live caller-side stream subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Requests waiting for their response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

fn unencodable(cause: &dyn fmt::Display) -> RpcError {
    RpcError::with_data(
        ErrorCode::Dispatch,
        REQUEST_UNENCODABLE,
        json!({ "cause": cause.to_string() }),
    )
}

fn encode_body<B: Serialize>(body: &B) -> Result<Value, RpcError> {
    serde_json::to_value(body).map_err(|e| unencodable(&e))
}

fn stream_body(is_unsubscribe: bool, key: &SubscriptionKey) -> Result<Value, RpcError> {
    encode_body(&StreamBody {
        is_unsubscribe,
        subscription_key: key.clone(),
    })
}
