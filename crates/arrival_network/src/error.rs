//! Network error types.

use std::time::Duration;

/// Errors that can occur in the arrival_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound message did not carry a usable envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An outbound message could not be shaped into an envelope.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has no open connection to the server.
    #[error("Not connected")]
    NotConnected,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded or saved.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
