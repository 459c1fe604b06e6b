//! Error taxonomy shared across the sync crates.

use thiserror::Error;

/// Result type alias used throughout the client-side sync crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-layer failures, kept separate so callers can distinguish
/// infrastructure problems from protocol-level rejections.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Tenant mismatch or missing session. Rejects a whole sync-up batch;
    /// nothing is applied.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Malformed event or request. Per-event; marks the event failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Server version diverged from the client's baseline. Per-event; the
    /// event is retained as conflicted until resolved.
    #[error("Version conflict for {entity}/{entity_id}: server at version {server_version}")]
    Conflict {
        entity: String,
        entity_id: String,
        server_version: i64,
    },

    /// Transport-level failure. No state changed; a blanket retry is safe.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid outbox status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}
