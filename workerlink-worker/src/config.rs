/// How a worker answers its bus.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Handle each request on its own task. When false, requests are handled
    /// one at a time in arrival order.
    pub spawn_per_request: bool,
    /// Name of the OS thread started by `spawn_worker`.
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            spawn_per_request: true,
            thread_name: "workerlink-worker".to_string(),
        }
    }
}
