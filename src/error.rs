//! FragStore Error Types

use thiserror::Error;

use crate::lock::RecordKey;
use crate::node::NodeId;

/// Result type alias for FragStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// FragStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Availability errors
    #[error("Node {0} is offline")]
    NodeOffline(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // Concurrency errors
    #[error("Lock timeout on key {key} after {waited_ms}ms (held by transaction {holder})")]
    LockTimeout {
        key: RecordKey,
        holder: String,
        waited_ms: u64,
    },

    #[error("Read timeout on key {key} after {waited_ms}ms waiting for in-flight write")]
    ReadTimeout { key: RecordKey, waited_ms: u64 },

    // Store errors
    #[error("Store error on {node}: {reason}")]
    Store { node: NodeId, reason: String },

    #[error("Could not parse operation: {0}")]
    Parse(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),
}

impl Error {
    /// Build a store error for a node
    pub fn store(node: NodeId, reason: impl Into<String>) -> Self {
        Error::Store {
            node,
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable without caller intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NodeOffline(_)
                | Error::LockTimeout { .. }
                | Error::ReadTimeout { .. }
                | Error::Network(_)
        )
    }

    /// Stable error code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::NodeOffline(_) => "NODE_OFFLINE",
            Error::UnknownNode(_) => "UNKNOWN_NODE",
            Error::LockTimeout { .. } => "LOCK_TIMEOUT",
            Error::ReadTimeout { .. } => "READ_TIMEOUT",
            Error::Store { .. } => "STORE_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
        }
    }
}
