use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Member not registered, forged token, or kind mismatch. Never crosses the bus.
    Capability,
    /// The connection has not been established yet.
    Precondition,
    /// The bus refused the payload (not copyable, closed, too large).
    Dispatch,
    /// The real member failed on the other side.
    Remote,
    BadRequest,
    NotFound,
    Canceled,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Capability => "capability",
            ErrorCode::Precondition => "precondition",
            ErrorCode::Dispatch => "dispatch",
            ErrorCode::Remote => "remote",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Capability, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Precondition, message)
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Dispatch, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Captures any error together with its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(Value::String(cause.to_string()));
            source = cause.source();
        }

        if causes.is_empty() {
            Self::internal(err.to_string())
        } else {
            Self::with_data(
                ErrorCode::Internal,
                err.to_string(),
                serde_json::json!({ "causes": causes }),
            )
        }
    }

    /// Flattens the error into a plain object that survives a structural copy.
    ///
    /// Object-shaped `data` is merged into the top level so that custom fields
    /// stay reachable by name on the other side. A remote error that is being
    /// relayed keeps its original payload.
    pub fn to_payload(&self) -> Value {
        if self.code == ErrorCode::Remote {
            if let Some(Value::Object(original)) = &self.data {
                return Value::Object(original.clone());
            }
        }

        let mut payload = Map::new();
        match &self.data {
            Some(Value::Object(fields)) => {
                payload.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(other) => {
                payload.insert("data".to_string(), other.clone());
            }
            None => {}
        }
        payload.insert("code".to_string(), Value::String(self.code.to_string()));
        payload.insert("message".to_string(), Value::String(self.message.clone()));
        Value::Object(payload)
    }

    /// Rebuilds a caller-side error from a payload produced by [`RpcError::to_payload`].
    pub fn from_payload(payload: Value) -> Self {
        let message = match payload.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => payload.to_string(),
        };
        Self::with_data(ErrorCode::Remote, message, payload)
    }

    /// Decodes the JSON text carried in a response's `error` field.
    pub fn from_serialized(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(payload) => Self::from_payload(payload),
            Err(_) => Self::new(ErrorCode::Remote, text),
        }
    }

    /// Encodes the error as JSON text for a response's `error` field.
    pub fn to_serialized(&self) -> String {
        let payload = self.to_payload();
        serde_json::to_string(&payload).unwrap_or_else(|_| self.message.clone())
    }

    /// Looks up a field of the remote payload, e.g. `remote_field("cause")`.
    pub fn remote_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::bad_request(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convenience_constructors() {
        assert_eq!(RpcError::capability("x").code, ErrorCode::Capability);
        assert_eq!(RpcError::precondition("x").code, ErrorCode::Precondition);
        assert_eq!(RpcError::dispatch("x").code, ErrorCode::Dispatch);
        assert_eq!(RpcError::not_found("x").code, ErrorCode::NotFound);
        assert_eq!(RpcError::canceled("x").code, ErrorCode::Canceled);
        assert_eq!(RpcError::timeout("x").code, ErrorCode::Timeout);
        assert_eq!(RpcError::internal("x").code, ErrorCode::Internal);
    }

    #[test]
    fn test_payload_keeps_custom_fields() {
        let err = RpcError::with_data(
            ErrorCode::Internal,
            "boom",
            json!({"cause": "disk full", "retryable": false}),
        );
        let payload = err.to_payload();
        assert_eq!(payload["message"], "boom");
        assert_eq!(payload["code"], "internal");
        assert_eq!(payload["cause"], "disk full");
        assert_eq!(payload["retryable"], false);
    }

    #[test]
    fn test_serialized_error_comes_back_as_remote() {
        let text = RpcError::internal("boom").to_serialized();
        let decoded = RpcError::from_serialized(&text);
        assert_eq!(decoded.code, ErrorCode::Remote);
        assert_eq!(decoded.message, "boom");
        assert_eq!(decoded.remote_field("code"), Some(&json!("internal")));
    }

    #[test]
    fn test_relayed_remote_error_is_unchanged() {
        let original = json!({"message": "boom", "code": "internal", "line": 7});
        let relayed = RpcError::from_payload(original.clone());
        assert_eq!(relayed.to_payload(), original);
    }

    #[test]
    fn test_unparseable_error_text_is_kept_verbatim() {
        let decoded = RpcError::from_serialized("not json");
        assert_eq!(decoded.code, ErrorCode::Remote);
        assert_eq!(decoded.message, "not json");
    }

    #[test]
    fn test_from_error_collects_sources() {
        let io = std::io::Error::other("inner");
        let err = RpcError::from_error(&io);
        assert_eq!(err.message, "inner");
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::dispatch("could not post");
        let display = format!("{}", err);
        assert!(display.contains("dispatch"));
        assert!(display.contains("could not post"));
    }
}
