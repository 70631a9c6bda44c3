use thiserror::Error;

/// Unified error type for server-side replication operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The targeted document has no materialized row.
    #[error("Document '{0}' not found")]
    NotFound(String),

    /// Optimistic concurrency check failed: the caller's expected version
    /// does not match the stored one. The caller should refetch and retry.
    #[error("Version conflict: expected {expected}, stored {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    /// A document arrived with a schema version the registered migration
    /// steps cannot bring up to date.
    #[error("No schema migration registered from version {from}")]
    MissingMigration { from: u32 },

    /// The request is malformed (bad collection, non-object document, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// CRDT bytes could not be decoded or merged.
    #[error("CRDT encoding error: {0}")]
    Codec(String),

    /// Underlying SQLite failure. The platform transaction has rolled
    /// back both storage legs; the client may retry the whole operation.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// HTTP status for the `{status, message}` wire envelope.
    ///
    /// 401/403 map to auth, 422 to validation on the client side;
    /// everything else is treated as retriable.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::NotFound(_) => 404,
            ServerError::VersionConflict { .. } => 409,
            ServerError::MissingMigration { .. } => 422,
            ServerError::InvalidRequest(_) => 422,
            ServerError::Codec(_) => 422,
            ServerError::Database(_) => 500,
            ServerError::Json(_) => 500,
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
