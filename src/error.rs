//! Error types for simplerpc.

use thiserror::Error;

/// Main error type for all simplerpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (text frames).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error (binary frames).
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (binary frames).
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// WebSocket protocol or handshake error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP server or upgraded-socket error on the responder side.
    #[error("Server error: {0}")]
    Server(#[from] axum::Error),

    /// Route path rejected (blank path cannot rebind the root).
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Connection token did not match the configured secret.
    #[error("Auth fail")]
    AuthFailed,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No transport attached (detached context or client not connected).
    #[error("Not connected")]
    NotConnected,

    /// The serialized worker is no longer accepting jobs.
    #[error("Dispatch worker stopped")]
    WorkerStopped,

    /// Application handler failure.
    #[error("{0}")]
    Handler(String),
}

impl RpcError {
    /// Build a handler error from any displayable message.
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler(message.into())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
