//! Engine error types
//!
//! Caller-facing failures carry a kind: not-found and precondition errors
//! go back to the caller untouched, transient storage errors are retried
//! internally, and invariant violations panic with a "BUG:" message since
//! they can only arise from logic errors.

use thiserror::Error;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The addressed workflow, instance, or shard does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A lifecycle precondition does not hold
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The workflow definition is invalid
    #[error("invalid workflow: {0}")]
    Validation(#[from] hiveflow_meta::MetaError),

    /// A guard expression does not parse
    #[error("invalid expression: {0}")]
    Expr(#[from] hiveflow_expr::ExprError),

    /// A runtime bound was exceeded despite validation
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A step evaluation failed; the tick is aborted and retried
    #[error("step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// The storage layer failed; retried internally where possible
    #[error(transparent)]
    Storage(#[from] hiveflow_storage::StorageError),

    /// A crowd could not be loaded
    #[error(transparent)]
    Crowd(#[from] hiveflow_crowd::CrowdError),

    /// A bitmap payload failed to parse
    #[error(transparent)]
    Bitmap(#[from] hiveflow_bitmap::BitmapError),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether an internal retry can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(
                hiveflow_storage::StorageError::Backend(_)
                    | hiveflow_storage::StorageError::Conflict(_)
            )
        )
    }
}
