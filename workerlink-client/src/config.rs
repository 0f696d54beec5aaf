use std::time::Duration;
use workerlink_core::{SECRET_LENGTH, SUBSCRIPTION_KEY_LENGTH};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host the worker inside this process over a loopback bus
    pub run_in_app: bool,
    /// Deep-copy every payload on the loopback bus, the way a thread
    /// boundary would
    pub mock_serialization: bool,
    /// Reject a pending request after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Random digits in a request secret
    pub secret_length: usize,
    /// Random digits in a subscription key
    pub subscription_key_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            run_in_app: false,
            mock_serialization: false,
            request_timeout: None,
            secret_length: SECRET_LENGTH,
            subscription_key_length: SUBSCRIPTION_KEY_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn in_app() -> Self {
        Self {
            run_in_app: true,
            ..Default::default()
        }
    }

    pub fn with_mock_serialization(mut self, mock: bool) -> Self {
        self.mock_serialization = mock;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
