pub mod client;
pub mod config;
pub mod in_app;
pub mod manager;
pub mod pending;
pub mod streams;
pub mod testing;

pub use client::{RequestOptions, TokenSource, WorkerClient};
pub use config::ClientConfig;
pub use in_app::InAppWorker;
pub use manager::{WorkerDefinition, WorkerFactory, WorkerManager};
pub use pending::PendingTable;
pub use streams::{RemoteObservable, RemoteSubscription, StreamHandle, StreamTable};
pub use testing::{create_test_client, TestClient};
