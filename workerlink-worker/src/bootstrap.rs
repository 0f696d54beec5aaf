use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error};
use workerlink_core::{descriptor, Remote};
use workerlink_transport::{channel_pair, ChannelBus, MessageBus, MessageHandler, TransportError};

use crate::config::WorkerConfig;
use crate::controller::{WorkerController, WorkerError};

/// Answers requests from `bus` with a fresh real instance of `T`.
pub fn bootstrap_worker<T: Remote>(bus: Arc<dyn MessageBus>) -> Result<WorkerController<T>, WorkerError> {
    WorkerController::attach(bus, WorkerConfig::default())
}

/// Caller end of a worker running on its own thread.
///
/// Terminating the bus stops the worker: it drops its subscriptions and the
/// thread exits.
pub struct WorkerThread {
    bus: ChannelBus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("closed", &self.bus.is_closed())
            .finish()
    }
}

impl WorkerThread {
    /// Waits for the worker thread to exit. Call after `terminate`.
    pub fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl MessageBus for WorkerThread {
    fn post_message(&self, payload: Value) -> Result<(), TransportError> {
        self.bus.post_message(payload)
    }

    fn set_onmessage(&self, handler: MessageHandler) -> Result<(), TransportError> {
        self.bus.set_onmessage(handler)
    }

    fn terminate(&self) {
        self.bus.terminate();
    }
}

/// Runs a worker for `T` on a dedicated OS thread with its own
/// current-thread runtime, connected through a channel bus.
pub fn spawn_worker<T: Remote>(config: WorkerConfig) -> Result<WorkerThread, WorkerError> {
    descriptor::<T>()?;
    let (caller_end, worker_end) = channel_pair();
    let thread_name = config.thread_name.clone();

    let thread = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "worker runtime could not be built");
                    worker_end.terminate();
                    return;
                }
            };

            runtime.block_on(async move {
                let worker_end = Arc::new(worker_end);
                match WorkerController::<T>::attach(worker_end.clone(), config) {
                    Ok(controller) => {
                        worker_end.closed().await;
                        controller.remove_all_subscriptions();
                    }
                    Err(e) => {
                        error!(error = %e, "worker could not be attached");
                        worker_end.terminate();
                    }
                }
            });
            debug!("worker thread exiting");
        })?;

    debug!(thread = %thread_name, "worker thread started");
    Ok(WorkerThread {
        bus: caller_end,
        thread: Mutex::new(Some(thread)),
    })
}
