//! Coordinator link errors

use thiserror::Error;

/// Errors that end a coordinator connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Dial, read or write failure on the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unexpected message type or ordering
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}
