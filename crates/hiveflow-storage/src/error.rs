//! Errors from storage operations

use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// The addressed record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A lifecycle precondition does not hold
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A conditional write lost its race
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored value failed to decode
    #[error("corrupted record at {0}")]
    Corrupted(String),

    /// Record encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected the operation
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl From<hiveflow_bitmap::BitmapError> for StorageError {
    fn from(err: hiveflow_bitmap::BitmapError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
