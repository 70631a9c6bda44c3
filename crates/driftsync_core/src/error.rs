use thiserror::Error;

use crate::sync::transport::TransportError;

/// Unified error type for replication operations.
#[derive(Debug, Error)]
pub enum ReplicateError {
    /// The stored or remote protocol version is invalid or cannot be
    /// migrated to. Sync is blocked until the mismatch is resolved.
    #[error("Protocol version error: {0}")]
    Protocol(String),

    /// Encoding or decoding of CRDT update bytes failed.
    ///
    /// This is fatal for the operation that produced it; callers must not
    /// retry with the same bytes.
    #[error("CRDT encoding error: {0}")]
    Codec(String),

    /// A server round-trip failed. Carries the wire `{status, message}`
    /// envelope; see [`TransportError::class`] for the retry classification.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local persistence error.
    #[error("Storage error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A document key was expected to exist locally but did not.
    #[error("Unknown document '{0}'")]
    MissingDocument(String),

    /// A submitted document or patch is not a JSON object.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Sync startup failed; replayed to every mutation awaiting the
    /// ready barrier.
    #[error("Sync initialization failed: {0}")]
    Initialization(String),
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;
