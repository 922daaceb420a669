//! Guard expressions
//!
//! Step transitions are guarded by small pure predicates over a user event:
//! the user ID, and the event's key/value payload. Expressions are stored
//! in workflow definitions in a compact text form (`uid % 2 == 0`,
//! `kv.city == "sh"`, `and(...)`) and compiled once per worker.

pub mod ast;
pub mod error;
mod parse;

pub use ast::{CmpOp, Expr, ExprContext};
pub use error::{ExprError, Result};
