use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use workerlink_core::{Remote, RpcError};

use crate::client::WorkerClient;
use crate::config::ClientConfig;
use crate::manager::WorkerDefinition;

/// In-app client with mocked serialization. Derefs to [`WorkerClient`].
pub struct TestClient<T: Remote> {
    client: WorkerClient<T>,
}

impl<T: Remote> Clone for TestClient<T> {
    fn clone(&self) -> Self {
        TestClient {
            client: self.client.clone(),
        }
    }
}

impl<T: Remote> fmt::Debug for TestClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestClient").field(&self.client).finish()
    }
}

pub fn create_test_client<T: Remote>() -> TestClient<T> {
    let config = ClientConfig::in_app().with_mock_serialization(true);
    TestClient {
        client: WorkerClient::new(WorkerDefinition::in_app_only(), config),
    }
}

impl<T: Remote> TestClient<T> {
    /// The real instance the worker side is serving.
    pub fn worker_instance(&self) -> Result<Arc<T>, RpcError> {
        self.client.in_app_instance().ok_or_else(|| {
            RpcError::precondition(
                "Cannot access worker instance until the connect method has been called",
            )
        })
    }

    pub fn client(&self) -> &WorkerClient<T> {
        &self.client
    }
}

impl<T: Remote> Deref for TestClient<T> {
    type Target = WorkerClient<T>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
