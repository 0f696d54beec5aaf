use crate::RpcError;
use serde::Serialize;
use serde_json::Value;

/// Turns any serializable envelope into the value handed to a bus.
pub fn to_payload<T: Serialize>(envelope: &T) -> Result<Value, RpcError> {
    serde_json::to_value(envelope).map_err(|e| RpcError::dispatch(e.to_string()))
}

/// Copies a payload through its JSON text, the way a serializing channel would.
pub fn structural_copy(payload: &Value) -> Result<Value, RpcError> {
    let text = serde_json::to_string(payload).map_err(|e| RpcError::dispatch(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| RpcError::dispatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_structural_copy_is_equal() {
        let payload = json!({"nested": {"list": [1, "a", null]}, "flag": true});
        assert_eq!(structural_copy(&payload).unwrap(), payload);
    }

    #[test]
    fn test_unencodable_envelope_is_a_dispatch_error() {
        let mut tuple_keys = BTreeMap::new();
        tuple_keys.insert((1, 2), "x");
        let err = to_payload(&tuple_keys).unwrap_err();
        assert_eq!(err.code, ErrorCode::Dispatch);
    }
}
