use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock, OnceLock};

use crate::emitter::{StreamEvent, Subscription};
use crate::gate::{Accessible, CapabilityToken, Gate, InstanceConfig, Streamable};
use crate::registry::{
    self, AccessibleMeta, Annotation, AnnotationRegistry, CallableMeta, Category, RegistryError,
    ShallowTransferArgMeta, StreamableMeta,
};
use crate::transfer::{Arg, CallArgs, TypeTag};
use crate::RpcError;

/// A type whose instances can live behind a worker.
///
/// `declare` runs once per process, on first use of the type. It fills the
/// global `AnnotationRegistry` and builds the type's `Descriptor`.
pub trait Remote: Send + Sync + Sized + 'static {
    /// Builds a bare, unconfigured instance.
    fn construct() -> Self;

    fn gate(&self) -> &Gate;

    fn declare(decl: &mut Declaration<Self>);
}

/// Optional initialization hook, run once per connection before the client
/// is marked connected.
#[async_trait]
pub trait OnWorkerInit: Send + Sync {
    async fn on_worker_init(&self) -> Result<(), RpcError>;
}

pub type CallHandler<T> =
    Arc<dyn Fn(Arc<T>, CallArgs) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
pub type InitHook<T> = Arc<dyn Fn(Arc<T>) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;
pub type StreamSink = Arc<dyn Fn(StreamEvent<Value>) + Send + Sync>;

type ReadFn<T> = Arc<dyn Fn(&T) -> Result<Value, RpcError> + Send + Sync>;
type WriteFn<T> = Arc<dyn Fn(&T, Arg) -> Result<(), RpcError> + Send + Sync>;
type ProbeFn<T> = Arc<dyn Fn(&T) -> Option<CapabilityToken> + Send + Sync>;
type AttachFn<T> = Arc<dyn Fn(&T, StreamSink) -> Subscription + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    returns: Option<TypeTag>,
    args: Vec<(usize, TypeTag)>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revive the return value as the tagged type on the caller side.
    pub fn transfer_return(mut self, tag: TypeTag) -> Self {
        self.returns = Some(tag);
        self
    }

    /// Revive positional argument `index` as the tagged type before the call.
    pub fn transfer_arg(mut self, index: usize, tag: TypeTag) -> Self {
        self.args.push((index, tag));
        self
    }
}

#[derive(Debug, Clone)]
pub struct AccessOptions {
    get: bool,
    set: bool,
    transfer: Option<TypeTag>,
}

impl Default for AccessOptions {
    fn default() -> Self {
        AccessOptions {
            get: true,
            set: true,
            transfer: None,
        }
    }
}

impl AccessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(mut self, allow: bool) -> Self {
        self.get = allow;
        self
    }

    pub fn set(mut self, allow: bool) -> Self {
        self.set = allow;
        self
    }

    pub fn transfer(mut self, tag: TypeTag) -> Self {
        self.transfer = Some(tag);
        self
    }
}

pub struct AccessBinding<T> {
    read: ReadFn<T>,
    write: WriteFn<T>,
    probe: ProbeFn<T>,
}

impl<T> fmt::Debug for AccessBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessBinding(..)")
    }
}

impl<T> AccessBinding<T> {
    pub fn read(&self, instance: &T) -> Result<Value, RpcError> {
        (self.read)(instance)
    }

    pub fn write(&self, instance: &T, value: Arg) -> Result<(), RpcError> {
        (self.write)(instance, value)
    }
}

pub struct StreamBinding<T> {
    attach: AttachFn<T>,
    probe: ProbeFn<T>,
}

impl<T> fmt::Debug for StreamBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamBinding(..)")
    }
}

impl<T> StreamBinding<T> {
    /// Subscribes `sink` to the member's emitter with values already converted
    /// to plain data.
    pub fn attach(&self, instance: &T, sink: StreamSink) -> Subscription {
        (self.attach)(instance, sink)
    }
}

/// Factory and member handlers of one remote type.
pub struct Descriptor<T> {
    type_name: &'static str,
    callables: IndexMap<String, CallHandler<T>>,
    accessibles: IndexMap<String, AccessBinding<T>>,
    streamables: IndexMap<String, StreamBinding<T>>,
    init: Option<InitHook<T>>,
}

impl<T> fmt::Debug for Descriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("type_name", &self.type_name)
            .field("callables", &self.callables.keys().collect::<Vec<_>>())
            .field("accessibles", &self.accessibles.keys().collect::<Vec<_>>())
            .field("streamables", &self.streamables.keys().collect::<Vec<_>>())
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl<T: Remote> Descriptor<T> {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Builds a fresh instance already configured as real or proxy.
    pub fn create(&self, config: InstanceConfig) -> Result<Arc<T>, RpcError> {
        let instance = T::construct();
        instance.gate().configure(config)?;
        Ok(Arc::new(instance))
    }

    pub fn callable(&self, name: &str) -> Option<&CallHandler<T>> {
        self.callables.get(name)
    }

    pub fn accessible(&self, name: &str) -> Option<&AccessBinding<T>> {
        self.accessibles.get(name)
    }

    pub fn streamable(&self, name: &str) -> Option<&StreamBinding<T>> {
        self.streamables.get(name)
    }

    pub fn init_hook(&self) -> Option<&InitHook<T>> {
        self.init.as_ref()
    }

    /// Reads an accessible or streamable member by name, the way a gated
    /// accessor would.
    pub fn probe(&self, instance: &T, name: &str) -> Option<CapabilityToken> {
        if let Some(binding) = self.accessibles.get(name) {
            return (binding.probe)(instance);
        }
        self.streamables
            .get(name)
            .and_then(|binding| (binding.probe)(instance))
    }
}

/// Builder handed to `Remote::declare`.
pub struct Declaration<T> {
    annotations: Vec<Annotation>,
    names: HashSet<String>,
    error: Option<RegistryError>,
    descriptor: Descriptor<T>,
}

impl<T> fmt::Debug for Declaration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("annotations", &self.annotations.len())
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl<T: Remote> Declaration<T> {
    fn new() -> Self {
        Declaration {
            annotations: vec![Annotation::Remotable],
            names: HashSet::new(),
            error: None,
            descriptor: Descriptor {
                type_name: std::any::type_name::<T>(),
                callables: IndexMap::new(),
                accessibles: IndexMap::new(),
                streamables: IndexMap::new(),
                init: None,
            },
        }
    }

    fn claim(&mut self, name: &str, category: Category) -> bool {
        if self.names.insert(name.to_string()) {
            return true;
        }
        if self.error.is_none() {
            let existing = self
                .annotations
                .iter()
                .find_map(|annotation| match annotation {
                    Annotation::Callable(m) if m.name == name => Some(Category::Callable),
                    Annotation::Accessible(m) if m.name == name => Some(Category::Accessible),
                    Annotation::Streamable(m) if m.name == name => Some(Category::Streamable),
                    _ => None,
                })
                .unwrap_or(category);
            self.error = Some(RegistryError::Duplicate {
                owner: self.descriptor.type_name.to_string(),
                member: name.to_string(),
                existing,
            });
        }
        false
    }

    fn push_callable(&mut self, name: &str, options: CallOptions, is_async: bool, handler: CallHandler<T>) {
        if !self.claim(name, Category::Callable) {
            return;
        }
        self.annotations.push(Annotation::Callable(CallableMeta {
            name: name.to_string(),
            shallow_transfer_return: options.returns,
            return_is_async: is_async,
        }));
        for (arg_index, tag) in options.args {
            self.annotations
                .push(Annotation::ShallowTransferArg(ShallowTransferArgMeta {
                    member: name.to_string(),
                    arg_index,
                    tag,
                }));
        }
        self.descriptor.callables.insert(name.to_string(), handler);
    }

    /// A method whose result is available immediately.
    pub fn callable<R, F>(&mut self, name: &str, options: CallOptions, handler: F) -> &mut Self
    where
        F: Fn(&T, CallArgs) -> Result<R, RpcError> + Send + Sync + 'static,
        R: Serialize,
    {
        let handler: CallHandler<T> = Arc::new(move |instance: Arc<T>, args| {
            let result = handler(&instance, args)
                .and_then(|value| serde_json::to_value(value).map_err(RpcError::from));
            future::ready(result).boxed()
        });
        self.push_callable(name, options, false, handler);
        self
    }

    /// A method returning a `Deferred`, awaited by the router.
    pub fn callable_async<R, F, Fut>(&mut self, name: &str, options: CallOptions, handler: F) -> &mut Self
    where
        F: Fn(Arc<T>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
        R: Serialize,
    {
        let handler: CallHandler<T> = Arc::new(move |instance, args| {
            let pending = handler(instance, args);
            async move {
                let value = pending.await?;
                serde_json::to_value(value).map_err(RpcError::from)
            }
            .boxed()
        });
        self.push_callable(name, options, true, handler);
        self
    }

    pub fn accessible<V>(&mut self, name: &str, options: AccessOptions, field: fn(&T) -> &Accessible<V>) -> &mut Self
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if !self.claim(name, Category::Accessible) {
            return self;
        }
        self.annotations.push(Annotation::Accessible(AccessibleMeta {
            name: name.to_string(),
            allow_get: options.get,
            allow_set: options.set,
            shallow_transfer: options.transfer,
        }));

        let member = name.to_string();
        let binding = AccessBinding {
            read: Arc::new(move |instance: &T| {
                field(instance).with(|value| serde_json::to_value(value).map_err(RpcError::from))
            }),
            write: Arc::new(move |instance: &T, value: Arg| {
                let value: V = value.into_typed()?;
                field(instance).set(value);
                Ok(())
            }),
            probe: Arc::new(move |instance: &T| {
                instance.gate().access(&member, field(instance)).into_token()
            }),
        };
        self.descriptor.accessibles.insert(name.to_string(), binding);
        self
    }

    pub fn streamable<V>(&mut self, name: &str, field: fn(&T) -> &Streamable<V>) -> &mut Self
    where
        V: Serialize + Send + 'static,
    {
        if !self.claim(name, Category::Streamable) {
            return self;
        }
        self.annotations.push(Annotation::Streamable(StreamableMeta {
            name: name.to_string(),
        }));

        let member = name.to_string();
        let binding = StreamBinding {
            attach: Arc::new(move |instance: &T, sink: StreamSink| {
                field(instance).emitter().observe(move |event: &StreamEvent<V>| {
                    let plain = match event {
                        StreamEvent::Next(value) => match serde_json::to_value(value) {
                            Ok(value) => StreamEvent::Next(value),
                            Err(err) => StreamEvent::Error(RpcError::dispatch(format!(
                                "Unable to serialize subscribable response from worker to client: {}",
                                err
                            ))),
                        },
                        StreamEvent::Error(err) => StreamEvent::Error(err.clone()),
                        StreamEvent::Complete => StreamEvent::Complete,
                    };
                    sink(plain);
                })
            }),
            probe: Arc::new(move |instance: &T| {
                instance.gate().stream(&member, field(instance)).into_token()
            }),
        };
        self.descriptor.streamables.insert(name.to_string(), binding);
        self
    }

    pub fn on_init<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.descriptor.init = Some(Arc::new(move |instance| hook(instance).boxed()));
        self
    }

    /// Uses the type's `OnWorkerInit` implementation as the init hook.
    pub fn init_hook(&mut self) -> &mut Self
    where
        T: OnWorkerInit,
    {
        self.on_init(|instance: Arc<T>| async move { instance.on_worker_init().await })
    }

    fn finish(self, registry: &AnnotationRegistry) -> Result<Descriptor<T>, RegistryError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let owner = TypeId::of::<T>();
        let type_name = self.descriptor.type_name;
        for annotation in self.annotations {
            registry.register(owner, type_name, annotation)?;
        }
        if let Some(annotations) = registry.annotations(owner) {
            registry::log_declared(type_name, &annotations);
        }
        Ok(self.descriptor)
    }
}

type Declared = Result<Arc<dyn Any + Send + Sync>, RegistryError>;

static DESCRIPTORS: LazyLock<DashMap<TypeId, Arc<OnceLock<Declared>>>> = LazyLock::new(DashMap::new);

/// The descriptor of `T`, declaring the type on first use.
pub fn descriptor<T: Remote>() -> Result<Arc<Descriptor<T>>, RegistryError> {
    let cell = DESCRIPTORS.entry(TypeId::of::<T>()).or_default().clone();
    let declared = cell.get_or_init(|| {
        let mut declaration = Declaration::<T>::new();
        T::declare(&mut declaration);
        declaration
            .finish(AnnotationRegistry::global())
            .map(|descriptor| Arc::new(descriptor) as Arc<dyn Any + Send + Sync>)
    });

    match declared {
        Ok(erased) => Arc::clone(erased)
            .downcast::<Descriptor<T>>()
            .map_err(|_| RegistryError::Mismatch {
                owner: std::any::type_name::<T>().to_string(),
            }),
        Err(err) => Err(err.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Deferred, Gated, GateMode};
    use crate::emitter::Emitter;
    use serde_json::json;
    use std::sync::Mutex;

    struct Counter {
        gate: Gate,
        label: Accessible<String>,
        total: Accessible<i64>,
        changes: Streamable<i64>,
    }

    impl Counter {
        fn label(&self) -> Gated<String> {
            self.gate.access("label", &self.label)
        }

        fn changes(&self) -> Gated<Emitter<i64>> {
            self.gate.stream("changes", &self.changes)
        }

        fn add(&self, amount: i64) -> Gated<i64> {
            self.gate.call("add", (amount,), |(amount,)| {
                let total = self.total.update(|t| {
                    *t += amount;
                    *t
                });
                self.changes.emitter().next(total);
                total
            })
        }

        fn slow_double(&self, value: i64) -> Gated<Deferred<i64>> {
            self.gate
                .call_async("slowDouble", (value,), |(value,)| async move { Ok(value * 2) })
        }
    }

    impl Remote for Counter {
        fn construct() -> Self {
            Counter {
                gate: Gate::new::<Counter>(),
                label: Accessible::new("counter".to_string()),
                total: Accessible::new(0),
                changes: Streamable::new(),
            }
        }

        fn gate(&self) -> &Gate {
            &self.gate
        }

        fn declare(decl: &mut Declaration<Self>) {
            decl.accessible("label", AccessOptions::new().set(false), |c| &c.label)
                .streamable("changes", |c| &c.changes)
                .callable("add", CallOptions::new(), |c, mut args| {
                    c.add(args.take(0)?).into_real()
                })
                .callable_async("slowDouble", CallOptions::new(), |c, mut args| async move {
                    let value: i64 = args.take(0)?;
                    c.slow_double(value).into_real()?.await
                });
        }
    }

    struct Clash {
        gate: Gate,
        a: Accessible<u8>,
    }

    impl Remote for Clash {
        fn construct() -> Self {
            Clash {
                gate: Gate::new::<Clash>(),
                a: Accessible::new(0),
            }
        }

        fn gate(&self) -> &Gate {
            &self.gate
        }

        fn declare(decl: &mut Declaration<Self>) {
            decl.accessible("a", AccessOptions::new(), |c| &c.a)
                .callable("a", CallOptions::new(), |_, _| Ok(()));
        }
    }

    #[test]
    fn test_declaration_registers_metadata_once() {
        let first = descriptor::<Counter>().unwrap();
        let second = descriptor::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let registry = AnnotationRegistry::global();
        let owner = TypeId::of::<Counter>();
        assert!(registry.is_remotable(owner));
        assert!(!registry.accessible(owner, "label").unwrap().allow_set);
        assert!(registry.callable(owner, "slowDouble").unwrap().return_is_async);
        assert!(!registry.callable(owner, "add").unwrap().return_is_async);
        assert_eq!(registry.lookup(owner, Category::Callable).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_member_fails_declaration() {
        let err = descriptor::<Clash>().unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { ref member, .. } if member == "a"));
        assert!(descriptor::<Clash>().is_err());
    }

    #[test]
    fn test_factory_builds_independent_instances() {
        let descriptor = descriptor::<Counter>().unwrap();
        let real = descriptor.create(InstanceConfig::real()).unwrap();
        let proxy = descriptor.create(InstanceConfig::proxy("CLIENT_p")).unwrap();

        assert_eq!(real.gate().mode(), GateMode::Real);
        assert_eq!(proxy.gate().mode(), GateMode::Proxy);
        assert_eq!(real.add(5), Gated::Real(5));
        assert_eq!(proxy.total.get(), 0);
        assert!(proxy.label().is_token());
        assert!(proxy.changes().is_token());
    }

    #[tokio::test]
    async fn test_handlers_drive_the_real_instance() {
        let descriptor = descriptor::<Counter>().unwrap();
        let real = descriptor.create(InstanceConfig::real()).unwrap();

        let add = descriptor.callable("add").unwrap();
        let result = add(real.clone(), CallArgs::plain(vec![json!(4)])).await.unwrap();
        assert_eq!(result, json!(4));

        let double = descriptor.callable("slowDouble").unwrap();
        let result = double(real.clone(), CallArgs::plain(vec![json!(21)])).await.unwrap();
        assert_eq!(result, json!(42));

        let label = descriptor.accessible("label").unwrap();
        label.write(&real, Arg::Plain(json!("renamed"))).unwrap();
        assert_eq!(label.read(&real).unwrap(), json!("renamed"));
    }

    #[test]
    fn test_stream_binding_converts_values() {
        let descriptor = descriptor::<Counter>().unwrap();
        let real = descriptor.create(InstanceConfig::real()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();

        let binding = descriptor.streamable("changes").unwrap();
        let subscription = binding.attach(
            &real,
            Arc::new(move |event| sink_seen.lock().unwrap().push(event)),
        );
        real.add(2);
        real.add(3);
        subscription.unsubscribe();
        real.add(1);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![StreamEvent::Next(json!(2)), StreamEvent::Next(json!(5))]
        );
    }

    #[test]
    fn test_probe_by_name() {
        let descriptor = descriptor::<Counter>().unwrap();
        let proxy = descriptor.create(InstanceConfig::proxy("CLIENT_p")).unwrap();
        let token = descriptor.probe(&proxy, "changes").unwrap();
        assert_eq!(token.member, "changes");
        assert!(descriptor.probe(&proxy, "missing").is_none());

        let real = descriptor.create(InstanceConfig::real()).unwrap();
        assert!(descriptor.probe(&real, "label").is_none());
    }
}
