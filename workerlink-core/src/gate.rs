use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{OnceLock, PoisonError, RwLock};
use std::task::{Context, Poll};

use crate::emitter::Emitter;
use crate::msg::EventKind;
use crate::registry::AnnotationRegistry;
use crate::RpcError;

/// Set exactly once, when the factory builds the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub is_proxy: bool,
    pub proxy_secret: Option<String>,
}

impl InstanceConfig {
    pub fn real() -> Self {
        InstanceConfig {
            is_proxy: false,
            proxy_secret: None,
        }
    }

    pub fn proxy(secret: impl Into<String>) -> Self {
        InstanceConfig {
            is_proxy: true,
            proxy_secret: Some(secret.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// No config attached: members behave as real.
    Unconfigured,
    Real,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Call,
    Access,
    Stream,
}

impl MemberKind {
    pub fn event_kind(self) -> EventKind {
        match self {
            MemberKind::Call => EventKind::Callable,
            MemberKind::Access => EventKind::Accessable,
            MemberKind::Stream => EventKind::Observable,
        }
    }
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberKind::Call => "callable",
            MemberKind::Access => "accessible",
            MemberKind::Stream => "streamable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenPayload {
    Call { args: Vec<Value> },
    Access { get: bool, set: bool },
    Stream,
    /// The call arguments could not be turned into plain data.
    Unencodable { reason: String },
}

/// What a proxy member hands back instead of running.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityToken {
    pub secret: String,
    pub kind: MemberKind,
    pub member: String,
    pub payload: TokenPayload,
}

impl CapabilityToken {
    /// Honoured only with the instance's secret and the expected kind.
    pub fn verify(&self, secret: &str, kind: MemberKind) -> bool {
        self.secret == secret && self.kind == kind
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Gated<T> {
    Real(T),
    Token(CapabilityToken),
}

impl<T> Gated<T> {
    pub fn is_token(&self) -> bool {
        matches!(self, Gated::Token(_))
    }

    pub fn token(&self) -> Option<&CapabilityToken> {
        match self {
            Gated::Token(token) => Some(token),
            Gated::Real(_) => None,
        }
    }

    pub fn into_token(self) -> Option<CapabilityToken> {
        match self {
            Gated::Token(token) => Some(token),
            Gated::Real(_) => None,
        }
    }

    pub fn real(self) -> Option<T> {
        match self {
            Gated::Real(value) => Some(value),
            Gated::Token(_) => None,
        }
    }

    pub fn into_real(self) -> Result<T, RpcError> {
        match self {
            Gated::Real(value) => Ok(value),
            Gated::Token(token) => Err(RpcError::capability(format!(
                "\"{}\" was reached through a proxy instance and has no local value",
                token.member
            ))),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Gated<U> {
        match self {
            Gated::Real(value) => Gated::Real(f(value)),
            Gated::Token(token) => Gated::Token(token),
        }
    }
}

/// Result of an asynchronous callable.
pub struct Deferred<T>(BoxFuture<'static, Result<T, RpcError>>);

impl<T> Deferred<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, RpcError>> + Send + 'static,
    {
        Deferred(Box::pin(future))
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred(..)")
    }
}

/// Backing storage of an accessible member.
#[derive(Debug, Default)]
pub struct Accessible<V> {
    value: RwLock<V>,
}

impl<V> Accessible<V> {
    pub fn new(value: V) -> Self {
        Accessible {
            value: RwLock::new(value),
        }
    }

    /// Writes the real value, whatever mode the owner is in.
    pub fn set(&self, value: V) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.value.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        f(&mut self.value.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<V: Clone> Accessible<V> {
    pub fn get(&self) -> V {
        self.with(V::clone)
    }
}

/// Backing storage of a streamable member.
#[derive(Debug)]
pub struct Streamable<V> {
    emitter: Emitter<V>,
}

impl<V> Streamable<V> {
    pub fn new() -> Self {
        Streamable {
            emitter: Emitter::new(),
        }
    }

    pub fn emitter(&self) -> &Emitter<V> {
        &self.emitter
    }
}

impl<V> Default for Streamable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance switch between real behaviour and capability tokens.
///
/// Gated accessors return `Gated::Real` for a real or unconfigured instance
/// and `Gated::Token` for a proxy.
pub struct Gate {
    owner: TypeId,
    owner_name: &'static str,
    config: OnceLock<InstanceConfig>,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("owner", &self.owner_name)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Gate {
    pub fn new<T: 'static>() -> Self {
        Gate {
            owner: TypeId::of::<T>(),
            owner_name: std::any::type_name::<T>(),
            config: OnceLock::new(),
        }
    }

    pub fn owner(&self) -> TypeId {
        self.owner
    }

    /// Attaches the config. A second attempt is refused.
    pub fn configure(&self, config: InstanceConfig) -> Result<(), RpcError> {
        self.config.set(config).map_err(|_| {
            RpcError::precondition(format!("{} instance is already configured", self.owner_name))
        })
    }

    pub fn config(&self) -> Option<&InstanceConfig> {
        self.config.get()
    }

    pub fn mode(&self) -> GateMode {
        match self.config.get() {
            None => GateMode::Unconfigured,
            Some(config) if config.is_proxy => GateMode::Proxy,
            Some(_) => GateMode::Real,
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.mode() == GateMode::Proxy
    }

    fn token(&self, kind: MemberKind, member: &str, payload: TokenPayload) -> CapabilityToken {
        let secret = self
            .config
            .get()
            .and_then(|config| config.proxy_secret.clone())
            .unwrap_or_default();
        CapabilityToken {
            secret,
            kind,
            member: member.to_string(),
            payload,
        }
    }

    pub fn access<V: Clone>(&self, name: &str, field: &Accessible<V>) -> Gated<V> {
        if self.is_proxy() {
            if let Some(meta) = AnnotationRegistry::global().accessible(self.owner, name) {
                return Gated::Token(self.token(
                    MemberKind::Access,
                    name,
                    TokenPayload::Access {
                        get: meta.allow_get,
                        set: meta.allow_set,
                    },
                ));
            }
        }
        Gated::Real(field.get())
    }

    pub fn stream<V>(&self, name: &str, field: &Streamable<V>) -> Gated<Emitter<V>> {
        if self.is_proxy() && AnnotationRegistry::global().streamable(self.owner, name).is_some() {
            return Gated::Token(self.token(MemberKind::Stream, name, TokenPayload::Stream));
        }
        Gated::Real(field.emitter().clone())
    }

    /// In proxy mode the arguments become the token payload and `body` never runs.
    pub fn call<A, R>(&self, name: &str, args: A, body: impl FnOnce(A) -> R) -> Gated<R>
    where
        A: Serialize,
    {
        if self.is_proxy() && AnnotationRegistry::global().callable(self.owner, name).is_some() {
            return Gated::Token(self.call_token(name, &args));
        }
        Gated::Real(body(args))
    }

    pub fn call_async<A, R, F>(&self, name: &str, args: A, body: impl FnOnce(A) -> F) -> Gated<Deferred<R>>
    where
        A: Serialize,
        F: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.call(name, args, |args| Deferred::new(body(args)))
    }

    fn call_token<A: Serialize>(&self, name: &str, args: &A) -> CapabilityToken {
        let payload = match serde_json::to_value(args) {
            Ok(Value::Array(args)) => TokenPayload::Call { args },
            Ok(Value::Null) => TokenPayload::Call { args: Vec::new() },
            Ok(single) => TokenPayload::Call { args: vec![single] },
            Err(err) => TokenPayload::Unencodable {
                reason: err.to_string(),
            },
        };
        self.token(MemberKind::Call, name, payload)
    }
}
