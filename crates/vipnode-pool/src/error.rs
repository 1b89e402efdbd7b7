//! Error types for the vipnode pool.

use thiserror::Error;
use vipnode_jsonrpc::RpcError;

/// Main error type for the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    // Authentication errors
    #[error("Invalid nonce {nonce} for node {node_id}")]
    InvalidNonce { node_id: String, nonce: i64 },

    #[error("Method {method:?} failed to verify signature: {message}")]
    Signature { method: String, message: String },

    #[error("Node ID {node_id} does not match node URI: {uri}")]
    IdentityMismatch { node_id: String, uri: String },

    // Admission errors
    #[error("{}", no_hosts_message(.tried))]
    NoHosts { tried: usize },

    #[error("{}", connect_failed_message(.errors))]
    ConnectFailed { errors: Vec<String> },

    // Operator errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    // Store errors
    #[error("Malformed node: {message}")]
    MalformedNode { message: String },

    #[error("Unregistered node: {node_id}")]
    UnregisteredNode { node_id: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Transport errors
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

fn no_hosts_message(tried: &usize) -> String {
    if *tried == 0 {
        "no host nodes available".to_string()
    } else {
        format!("no available host nodes found after trying {} nodes", tried)
    }
}

fn connect_failed_message(errors: &[String]) -> String {
    if errors.is_empty() {
        return "no host connection errors".to_string();
    }
    format!(
        "failed to connect to {} hosts: {}",
        errors.len(),
        errors.join("; ")
    )
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl From<rusqlite::Error> for PoolError {
    fn from(err: rusqlite::Error) -> Self {
        PoolError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PoolError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PoolError::Configuration {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport error
    /// - -32001: Authentication failed (nonce, signature, identity)
    /// - -32002: No hosts admitted the client
    /// - -32003: Pool misconfiguration
    /// - -32004: Not implemented
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            PoolError::InvalidNonce { .. }
            | PoolError::Signature { .. }
            | PoolError::IdentityMismatch { .. } => -32001,

            PoolError::NoHosts { .. } | PoolError::ConnectFailed { .. } => -32002,

            PoolError::Configuration { .. } => -32003,

            PoolError::NotImplemented { .. } => -32004,

            PoolError::MalformedNode { .. } | PoolError::UnregisteredNode { .. } => -32005,

            PoolError::Rpc(err) => err.to_rpc_error_code(),

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// The wire code if this error came back from the remote side of a call.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            PoolError::Rpc(RpcError::Remote { code, .. }) => Some(*code),
            _ => None,
        }
    }
}

impl From<PoolError> for RpcError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Rpc(inner) => inner,
            other => RpcError::remote(other.to_rpc_error_code(), other.to_string()),
        }
    }
}
