//! Errors from crowd loading

use thiserror::Error;

/// Errors from crowd loading
#[derive(Debug, Error)]
pub enum CrowdError {
    /// The loader metadata does not parse
    #[error("invalid loader metadata: {0}")]
    InvalidMeta(String),

    /// A referenced bitmap chunk is absent
    #[error("missing crowd chunk: {0}")]
    MissingChunk(String),

    /// This loader cannot persist bitmaps
    #[error("loader is read-only")]
    ReadOnlyLoader,

    /// The stored payload is not a bitmap
    #[error(transparent)]
    Bitmap(#[from] hiveflow_bitmap::BitmapError),

    /// The underlying store failed
    #[error(transparent)]
    Storage(#[from] hiveflow_storage::StorageError),
}

/// Result type for crowd loading
pub type Result<T> = std::result::Result<T, CrowdError>;
