//! Expression errors

use thiserror::Error;

/// Expression errors
#[derive(Debug, Error)]
pub enum ExprError {
    /// The text form does not parse
    #[error("cannot parse expression '{text}': {reason}")]
    Parse { text: String, reason: String },

    /// A modulus of zero would divide by zero at evaluation time
    #[error("modulus must not be zero")]
    ZeroModulus,
}

/// Result type for expression operations
pub type Result<T> = std::result::Result<T, ExprError>;
