use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use workerlink_core::{descriptor, Remote, RpcError};
use workerlink_transport::MessageBus;
use workerlink_worker::{spawn_worker, WorkerConfig};

use crate::client::WorkerClient;
use crate::config::ClientConfig;

pub type WorkerFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageBus>, RpcError> + Send + Sync>;

/// How to reach a worker for `T` when it does not run in-app.
pub struct WorkerDefinition<T> {
    factory: Option<WorkerFactory>,
    _remote: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkerDefinition<T> {
    fn clone(&self) -> Self {
        WorkerDefinition {
            factory: self.factory.clone(),
            _remote: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WorkerDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("target", &std::any::type_name::<T>())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

impl<T: Remote> WorkerDefinition<T> {
    /// Each connect calls `factory` for a fresh bus to a fresh worker.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn MessageBus>, RpcError> + Send + Sync + 'static,
    {
        WorkerDefinition {
            factory: Some(Arc::new(factory)),
            _remote: PhantomData,
        }
    }

    /// A worker on its own thread per connection.
    pub fn threaded(config: WorkerConfig) -> Self {
        Self::new(move || {
            let worker = spawn_worker::<T>(config.clone())?;
            Ok(Arc::new(worker) as Arc<dyn MessageBus>)
        })
    }

    /// Only reachable with `run_in_app`.
    pub fn in_app_only() -> Self {
        WorkerDefinition {
            factory: None,
            _remote: PhantomData,
        }
    }

    pub(crate) fn open(&self) -> Result<Arc<dyn MessageBus>, RpcError> {
        match &self.factory {
            Some(factory) => factory(),
            None => Err(RpcError::precondition(format!(
                "{} has no worker factory and can only run in-app",
                std::any::type_name::<T>()
            ))),
        }
    }
}

/// Worker definitions, one per remote type.
#[derive(Default)]
pub struct WorkerManager {
    definitions: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerManager")
            .field("definitions", &self.definitions.len())
            .finish()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `T` and stores its definition, replacing any earlier one.
    pub fn register<T: Remote>(&self, definition: WorkerDefinition<T>) -> Result<(), RpcError> {
        descriptor::<T>()?;
        self.definitions
            .insert(TypeId::of::<T>(), Arc::new(definition));
        debug!(target_type = std::any::type_name::<T>(), "worker definition registered");
        Ok(())
    }

    pub fn is_registered<T: Remote>(&self) -> bool {
        self.definitions.contains_key(&TypeId::of::<T>())
    }

    pub fn create_client<T: Remote>(&self, run_in_app: bool) -> Result<WorkerClient<T>, RpcError> {
        self.create_client_with(ClientConfig {
            run_in_app,
            ..Default::default()
        })
    }

    pub fn create_client_with<T: Remote>(&self, config: ClientConfig) -> Result<WorkerClient<T>, RpcError> {
        let definition = self
            .definitions
            .get(&TypeId::of::<T>())
            .map(|entry| Arc::clone(entry.value()))
            .and_then(|any| any.downcast::<WorkerDefinition<T>>().ok())
            .ok_or_else(|| {
                RpcError::precondition(
                    "all workers must be registered with the WorkerManager before a client can be created",
                )
            })?;
        Ok(WorkerClient::new(definition.as_ref().clone(), config))
    }
}
