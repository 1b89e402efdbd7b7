//! The JSON-RPC 2.0 wire envelope.
//!
//! A single [`Message`] type carries both shapes that travel over a session:
//! calls (with `method`) and results (with `id` and either `result` or `error`).
//! Both parties of a bidirectional session send both shapes, so the envelope
//! is not split into request/response types.

use crate::error::{Result, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Keep an explicit `null` as `Some(Value::Null)` so a successful call that
/// returned nothing is still distinguishable from a missing field.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 message: either a call or a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Positional params. Kept as a raw value on the wire so a peer sending
    /// named params gets an `InvalidParams` result instead of a decode failure
    /// that would tear down the whole session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Classification of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A call expecting a result.
    Call,
    /// A fire-and-forget call (no `id`).
    Notification,
    /// A result (success or error) for an earlier call.
    Result,
    /// Neither shape: both `method` and `result`/`error`, or nothing at all.
    Invalid,
}

impl Message {
    fn empty() -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    /// Create a call with a numeric correlation id.
    pub fn call(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Some(Value::Number(id.into())),
            method: Some(method.into()),
            params: Some(Value::Array(params)),
            ..Self::empty()
        }
    }

    /// Create a fire-and-forget call that expects no result.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(Value::Array(params)),
            ..Self::empty()
        }
    }

    /// Create a success result.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Create an error result.
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::empty()
        }
    }

    /// Create an error result from an [`RpcError`].
    pub fn failure(id: Option<Value>, err: &RpcError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.wire_message())
    }

    /// Classify this message.
    pub fn kind(&self) -> MessageKind {
        let has_outcome = self.result.is_some() || self.error.is_some();
        match (&self.method, &self.id) {
            (Some(_), _) if has_outcome => MessageKind::Invalid,
            (Some(_), Some(_)) => MessageKind::Call,
            (Some(_), None) => MessageKind::Notification,
            (None, Some(_)) => MessageKind::Result,
            (None, None) => MessageKind::Invalid,
        }
    }

    /// Whether this message is a call (with or without an `id`).
    pub fn is_call(&self) -> bool {
        matches!(self.kind(), MessageKind::Call | MessageKind::Notification)
    }

    /// Whether this message is a result.
    pub fn is_result(&self) -> bool {
        self.kind() == MessageKind::Result
    }

    /// The numeric correlation id, if the id is one this crate could have assigned.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Unwrap a result message into its value or the carried remote error.
    ///
    /// A success with no `result` field reads as `null`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}
