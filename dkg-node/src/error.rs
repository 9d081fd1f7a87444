use thiserror::Error;

use crate::types::PeerId;

/// Main error type for node operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// Network-related errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Protocol violations or explicit rejections from a peer
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        peer: Option<PeerId>,
    },

    /// Message or payload serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A protocol exchange did not complete in time
    #[error("Operation timed out: {phase:?} after {duration_ms}ms")]
    Timeout { phase: Phase, duration_ms: u64 },

    /// Node state errors
    #[error("Invalid node state: {message}")]
    InvalidState { message: String },

    /// A sequence names a command kind nobody registered
    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    /// Not enough live, reachable peers to reach the replication floor
    #[error("Unable to find enough nodes for operationId: {operation_id}. Minimum number of nodes required: {required}")]
    InsufficientShard {
        operation_id: String,
        required: usize,
        found: usize,
    },

    /// Command persistence errors
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// I/O errors (wrapper for `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors for unexpected conditions
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Protocol phases that carry their own timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Request,
}

impl NodeError {
    pub fn network<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }
    pub fn network_msg(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }
    pub fn protocol(message: impl Into<String>, peer: Option<PeerId>) -> Self {
        Self::Protocol {
            message: message.into(),
            peer,
        }
    }
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
    #[must_use]
    pub const fn timeout(phase: Phase, duration_ms: u64) -> Self {
        Self::Timeout { phase, duration_ms }
    }
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
    pub fn unknown_command(name: impl Into<String>) -> Self {
        Self::UnknownCommand { name: name.into() }
    }
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization("JSON payload", e)
    }
}

/// Result type alias for node operations
pub type Result<T, E = NodeError> = std::result::Result<T, E>;
