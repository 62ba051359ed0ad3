//! Core type definitions for Bandstand.
//!
//! This crate defines the identifiers that cross crate boundaries:
//! - User identifiers (UUID v7), for accounts and transient guests
//! - Session identifiers, short human-readable tokens carried in join codes
//!
//! Document, session and transport types live in `bandstand-crdt` and
//! `bandstand-sync`.

mod ids;

pub use ids::{SessionId, UserId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}
