pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod logging;
pub mod subscriptions;

pub use bootstrap::{bootstrap_worker, spawn_worker, WorkerThread};
pub use config::WorkerConfig;
pub use controller::{WorkerController, WorkerError};
pub use logging::{init_logging, init_test_logging};
pub use subscriptions::SubscriptionTable;
