//! Error types for metadata validation

use thiserror::Error;

/// Error type for metadata validation
#[derive(Debug, Error)]
pub enum MetaError {
    /// A required field is missing or empty
    #[error("missing field: {0}")]
    MissingField(String),

    /// Two steps share a name
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// A step references a target that does not exist
    #[error("step '{step}' targets unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    /// Direct steps form a cycle, which would chain forever
    #[error("direct steps form a cycle through '{0}'")]
    DirectCycle(String),
}

/// Result type for metadata validation
pub type Result<T> = std::result::Result<T, MetaError>;
