//! Error types for sync-store.

use std::path::PathBuf;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored body or metadata blob could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row holds values that do not decode into a record.
    #[error("corrupt record {uuid}: {reason}")]
    Corrupt {
        /// Uuid column of the row.
        uuid: String,
        /// What failed to decode.
        reason: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },

    /// Failure injected or reported by a wrapping store.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
