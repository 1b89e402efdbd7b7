//! Error types for the JSON-RPC session layer.
//!
//! Errors fall into three scopes:
//! - Codec-level (`Connection`, `Decode`): fatal to the session that hit them.
//! - Per-call (`Cancelled`, `Overloaded`, `Closed`, `Remote`): visible to one caller,
//!   the session survives.
//! - Protocol-level (`MethodNotFound`, `InvalidParams`, `InvalidRequest`): reported
//!   back to the remote party as an error result, never raised inside the session.

use thiserror::Error;

/// JSON-RPC 2.0 reserved error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Application-defined: transport, cancellation and overload failures.
    pub const TRANSPORT_ERROR: i32 = -32000;
}

/// Main error type for the JSON-RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    // Codec errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Decode error: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Per-call errors
    #[error("Call cancelled")]
    Cancelled,

    #[error("Call discarded: too many pending calls")]
    Overloaded,

    #[error("Session closed")]
    Closed,

    /// An error result carried back from the remote party.
    #[error("{message} (code {code})")]
    Remote { code: i32, message: String },

    // Protocol errors
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    // Registration errors
    #[error("Namespace already registered: {prefix}")]
    DuplicatePrefix { prefix: String },
}

/// Result type alias for JSON-RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Connection {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Decode {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a connection error without an underlying IO error.
    pub fn connection(message: impl Into<String>) -> Self {
        RpcError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a decode error without an underlying serde error.
    pub fn decode(message: impl Into<String>) -> Self {
        RpcError::Decode {
            message: message.into(),
            source: None,
        }
    }

    /// Create an error carrying an application-defined code.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        RpcError::Remote {
            code,
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// `Remote` errors keep the code they arrived with, so a handler error
    /// relayed through several sessions is reported unchanged.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Decode { .. } => codes::PARSE_ERROR,
            RpcError::InvalidRequest { .. } => codes::INVALID_REQUEST,
            RpcError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            RpcError::InvalidParams { .. } => codes::INVALID_PARAMS,
            RpcError::Remote { code, .. } => *code,

            RpcError::Connection { .. }
            | RpcError::Cancelled
            | RpcError::Overloaded
            | RpcError::Closed => codes::TRANSPORT_ERROR,

            RpcError::DuplicatePrefix { .. } => codes::INTERNAL_ERROR,
        }
    }

    /// The message sent on the wire for this error.
    ///
    /// `Remote` errors forward their original message rather than the
    /// decorated `Display` form.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error terminates the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RpcError::Connection { .. } | RpcError::Decode { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::MethodNotFound {
            method: "foo_bar".into(),
        };
        assert_eq!(err.to_string(), "Method not found: foo_bar");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            RpcError::MethodNotFound {
                method: "x".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            RpcError::InvalidParams {
                message: "x".into()
            }
            .to_rpc_error_code(),
            -32602
        );
        assert_eq!(RpcError::remote(-32042, "nope").to_rpc_error_code(), -32042);
        assert_eq!(RpcError::Cancelled.to_rpc_error_code(), -32000);
    }

    #[test]
    fn test_remote_wire_message_is_undecorated() {
        let err = RpcError::remote(-32001, "invalid nonce");
        assert_eq!(err.wire_message(), "invalid nonce");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(RpcError::connection("reset").is_fatal());
        assert!(RpcError::decode("garbage").is_fatal());
        assert!(!RpcError::Cancelled.is_fatal());
        assert!(!RpcError::Overloaded.is_fatal());
    }
}
