//! Compiled step executions
//!
//! Guard expressions are parsed once when a worker is built; a tick then
//! evaluates compiled steps only.

use crate::error::Result;
use hiveflow_expr::Expr;
use hiveflow_meta::{Execution, Step, Workflow};

/// A step with its expressions parsed
#[derive(Debug, Clone)]
pub(crate) struct CompiledStep {
    pub step: Step,
    pub execution: CompiledExecution,
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledExecution {
    Timer {
        interval_secs: u64,
        expr: Expr,
        target: String,
    },
    Direct {
        target: String,
    },
    Conditional {
        branches: Vec<(Expr, String)>,
    },
}

impl CompiledStep {
    /// The direct target, when this is a direct step
    pub fn direct_target(&self) -> Option<&str> {
        match &self.execution {
            CompiledExecution::Direct { target } => Some(target),
            _ => None,
        }
    }
}

/// Parse every expression in the workflow's steps
pub(crate) fn compile_steps(workflow: &Workflow) -> Result<Vec<CompiledStep>> {
    workflow
        .steps
        .iter()
        .map(|step| {
            let execution = match &step.execution {
                Execution::Timer {
                    interval_secs,
                    expr,
                    target,
                } => CompiledExecution::Timer {
                    interval_secs: *interval_secs,
                    expr: Expr::parse(expr)?,
                    target: target.clone(),
                },
                Execution::Direct { target } => CompiledExecution::Direct {
                    target: target.clone(),
                },
                Execution::Conditional { branches } => CompiledExecution::Conditional {
                    branches: branches
                        .iter()
                        .map(|b| Ok((Expr::parse(&b.expr)?, b.target.clone())))
                        .collect::<Result<Vec<_>>>()?,
                },
            };
            Ok(CompiledStep {
                step: step.clone(),
                execution,
            })
        })
        .collect()
}
