//! Error types for the SignalR client

use thiserror::Error;

/// Errors that can occur when using the SignalR client
#[derive(Error, Debug)]
pub enum SignalRError {
    /// Transport-level failure: connect, send or receive on the WebSocket
    #[error("Connection error: {0}")]
    Connection(String),

    /// The negotiation HTTP call failed with a non-auth error
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Negotiation was rejected with 401/403
    #[error("Authorization rejected")]
    Authorization,

    /// The server rejected the protocol handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be decoded; fatal for the connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server reported an error completing an invocation
    #[error("Server error: {0}")]
    Server(String),

    /// An operation was attempted while not connected
    #[error("Not connected")]
    NotConnected,

    /// The client has been closed
    #[error("Client closed")]
    Closed,

    /// Failed to serialize/deserialize a message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SignalRError {
    /// Whether this error is terminal: the reconnect loop does not retry
    /// credential or protocol misconfiguration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalRError::Authorization | SignalRError::Handshake(_))
    }
}

/// Result type for SignalR operations
pub type Result<T> = std::result::Result<T, SignalRError>;
