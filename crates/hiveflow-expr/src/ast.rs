//! Expression AST and evaluation

use hiveflow_bitmap::RoaringBitmap;
use hiveflow_meta::Kv;
use serde::{Deserialize, Serialize};

/// Comparison operator of a field predicate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A guard expression
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Expr {
    /// Matches every user
    All,

    /// `uid % modulus == remainder`
    UserIdMod { modulus: u32, remainder: u32 },

    /// Compare an event payload field against a constant
    Field {
        key: String,
        op: CmpOp,
        value: String,
    },

    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// What an expression is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct ExprContext<'a> {
    pub user_id: u32,

    /// Event payload; empty for timer-driven evaluation
    pub data: &'a [Kv],
}

impl<'a> ExprContext<'a> {
    pub fn new(user_id: u32, data: &'a [Kv]) -> Self {
        Self { user_id, data }
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

impl Expr {
    /// Evaluate against one user
    pub fn eval(&self, ctx: &ExprContext<'_>) -> bool {
        match self {
            Expr::All => true,
            Expr::UserIdMod { modulus, remainder } => {
                *modulus != 0 && ctx.user_id % modulus == *remainder
            }
            Expr::Field { key, op, value } => match ctx.value(key) {
                Some(actual) => compare(actual, *op, value),
                // absent fields match nothing
                None => false,
            },
            Expr::And(children) => children.iter().all(|c| c.eval(ctx)),
            Expr::Or(children) => children.iter().any(|c| c.eval(ctx)),
            Expr::Not(child) => !child.eval(ctx),
        }
    }

    /// Bulk evaluation: the subset of `crowd` matching with an empty
    /// payload. Used by timer steps, whose firing carries no event.
    pub fn filter(&self, crowd: &RoaringBitmap) -> RoaringBitmap {
        crowd
            .iter()
            .filter(|id| self.eval(&ExprContext::new(*id, &[])))
            .collect()
    }
}

/// Numeric comparison when both sides parse as integers, lexicographic
/// otherwise
fn compare(actual: &str, op: CmpOp, expected: &str) -> bool {
    if let (Ok(a), Ok(b)) = (actual.parse::<i64>(), expected.parse::<i64>()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
        };
    }

    match op {
        CmpOp::Eq => actual == expected,
        CmpOp::Ne => actual != expected,
        CmpOp::Gt => actual > expected,
        CmpOp::Ge => actual >= expected,
        CmpOp::Lt => actual < expected,
        CmpOp::Le => actual <= expected,
    }
}
