//! Error types for the sync layer.

use bandstand_crdt::CrdtError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport cannot be used on this device (radio off, no capability wired).
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Could not establish a connection or join a room.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Protocol error (malformed frame or message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Blob or session storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The replica rejected an update.
    #[error("replica error: {0}")]
    Replica(#[from] CrdtError),

    /// Join code, QR or bootstrap payload could not be parsed.
    #[error("invalid join code: {0}")]
    InvalidJoinCode(String),

    /// No active session with that id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Identifier error.
    #[error(transparent)]
    Types(#[from] bandstand_types::Error),
}
