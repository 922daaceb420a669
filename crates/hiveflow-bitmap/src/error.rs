//! Error types for bitmap parsing

use thiserror::Error;

/// Error type for bitmap operations
#[derive(Debug, Error)]
pub enum BitmapError {
    /// The bytes are not a valid roaring bitmap serialization
    #[error("corrupted bitmap payload: {0}")]
    Corrupted(String),
}

/// Result type for bitmap operations
pub type Result<T> = std::result::Result<T, BitmapError>;
