use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::keys::{CorrelationId, SubscriptionKey};

/// The `type` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventKind {
    Callable,
    Accessable,
    Observable,
    ObservableMessage,
    Init,
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> u8 {
        match kind {
            EventKind::Callable => 1,
            EventKind::Accessable => 2,
            EventKind::Observable => 3,
            EventKind::ObservableMessage => 4,
            EventKind::Init => 5,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventKind::Callable),
            2 => Ok(EventKind::Accessable),
            3 => Ok(EventKind::Observable),
            4 => Ok(EventKind::ObservableMessage),
            5 => Ok(EventKind::Init),
            other => Err(format!("unknown event type {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StreamMessageKind {
    Next,
    Error,
    Complete,
}

impl From<StreamMessageKind> for u8 {
    fn from(kind: StreamMessageKind) -> u8 {
        match kind {
            StreamMessageKind::Next => 1,
            StreamMessageKind::Error => 2,
            StreamMessageKind::Complete => 3,
        }
    }
}

impl TryFrom<u8> for StreamMessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            1 => Ok(StreamMessageKind::Next),
            2 => Ok(StreamMessageKind::Error),
            3 => Ok(StreamMessageKind::Complete),
            other => Err(format!("unknown stream message type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_secret: CorrelationId,
    pub property_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// `None` only for stream messages, which answer no request.
    pub request_secret: Option<CorrelationId>,
    pub property_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub is_error: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(request: &RequestEnvelope, result: Value) -> Self {
        ResponseEnvelope {
            request_secret: Some(request.request_secret.clone()),
            property_name: request.property_name.clone(),
            kind: request.kind,
            is_error: false,
            result,
            error: None,
        }
    }

    pub fn failure(request: &RequestEnvelope, error: &RpcError) -> Self {
        ResponseEnvelope {
            request_secret: Some(request.request_secret.clone()),
            property_name: request.property_name.clone(),
            kind: request.kind,
            is_error: true,
            result: Value::Null,
            error: Some(error.to_serialized()),
        }
    }

    /// Wraps an unsolicited stream message for `member`.
    pub fn stream(member: &str, message: &StreamMessage) -> Result<Self, serde_json::Error> {
        Ok(ResponseEnvelope {
            request_secret: None,
            property_name: Some(member.to_string()),
            kind: EventKind::ObservableMessage,
            is_error: message.kind == StreamMessageKind::Error,
            result: serde_json::to_value(message)?,
            error: None,
        })
    }

    /// The decoded remote error, if this is an error response.
    pub fn remote_error(&self) -> Option<RpcError> {
        if !self.is_error {
            return None;
        }
        Some(match &self.error {
            Some(text) => RpcError::from_serialized(text),
            None => RpcError::from_payload(self.result.clone()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub key: SubscriptionKey,
    #[serde(rename = "type")]
    pub kind: StreamMessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StreamMessage {
    pub fn next(key: SubscriptionKey, value: Value) -> Self {
        StreamMessage {
            key,
            kind: StreamMessageKind::Next,
            value: Some(value),
            error: None,
        }
    }

    pub fn error(key: SubscriptionKey, error: &RpcError) -> Self {
        StreamMessage {
            key,
            kind: StreamMessageKind::Error,
            value: None,
            error: Some(error.to_payload()),
        }
    }

    pub fn complete(key: SubscriptionKey) -> Self {
        StreamMessage {
            key,
            kind: StreamMessageKind::Complete,
            value: None,
            error: None,
        }
    }
}

/// Body of a `Callable` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallBody {
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Body of an `Accessable` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessBody {
    pub is_get: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Body of an `Observable` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    pub is_unsubscribe: bool,
    pub subscription_key: SubscriptionKey,
}

/// A payload arriving on the caller side, classified by its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(ResponseEnvelope),
    Stream {
        member: Option<String>,
        message: StreamMessage,
    },
}

impl Inbound {
    /// Classifies a payload arriving on the caller side.
    pub fn from_value(payload: Value) -> Result<Self, RpcError> {
        let response: ResponseEnvelope = serde_json::from_value(payload)?;
        if response.kind == EventKind::ObservableMessage {
            let message: StreamMessage = serde_json::from_value(response.result)?;
            Ok(Inbound::Stream {
                member: response.property_name,
                message,
            })
        } else {
            Ok(Inbound::Response(response))
        }
    }
}
