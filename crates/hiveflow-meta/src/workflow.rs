//! Workflow definition types
//!
//! A workflow is a directed graph of named steps. Each step carries an
//! execution — how users leave it — and an optional TTL bounding how long a
//! user may sit in it. Guard expressions are stored in their compact text
//! form and compiled by the engine when a worker is built.

use crate::error::{MetaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Stable workflow ID
    pub id: u64,

    /// Owning tenant
    pub tenant_id: u64,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Seconds an instance runs before it is stopped; 0 = unbounded
    #[serde(default)]
    pub duration_secs: u64,

    /// Ordered steps; step 0 is where new crowd members are admitted
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Create a new workflow definition
    pub fn new(id: u64, tenant_id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            name: name.into(),
            duration_secs: 0,
            steps: Vec::new(),
        }
    }

    /// Bound the lifetime of instances of this workflow
    pub fn with_duration(mut self, duration_secs: u64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    /// Append a step
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Look up a step index by name
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Validate the step graph
    ///
    /// Rejects empty workflows, duplicate step names, dangling targets, and
    /// cycles made purely of direct steps (a direct-only cycle would chain
    /// forever at runtime).
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(MetaError::MissingField("steps".to_string()));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(MetaError::MissingField("step.name".to_string()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(MetaError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &self.steps {
            for target in step.targets() {
                if !names.contains(target) {
                    return Err(MetaError::UnknownTarget {
                        step: step.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        self.check_direct_cycles()
    }

    /// Walk the direct-step edges; every chain must leave the direct
    /// subgraph within `steps.len()` hops, otherwise it is a cycle.
    fn check_direct_cycles(&self) -> Result<()> {
        let direct: HashMap<&str, &str> = self
            .steps
            .iter()
            .filter_map(|s| match &s.execution {
                Execution::Direct { target } => Some((s.name.as_str(), target.as_str())),
                _ => None,
            })
            .collect();

        for start in direct.keys() {
            let mut cursor = *start;
            for _ in 0..self.steps.len() {
                match direct.get(cursor) {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            if direct.contains_key(cursor) {
                return Err(MetaError::DirectCycle(start.to_string()));
            }
        }

        Ok(())
    }
}

/// One node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique name within the workflow
    pub name: String,

    /// How users leave this step
    pub execution: Execution,

    /// Seconds a user may remain here before being force-moved; 0 = none
    #[serde(default)]
    pub ttl_secs: u32,

    /// Whether transitions into this step emit an output-queue record
    #[serde(default)]
    pub notify: bool,
}

impl Step {
    /// A step whose expression is evaluated when a user event arrives
    pub fn conditional(name: impl Into<String>, branches: Vec<Branch>) -> Self {
        Self {
            name: name.into(),
            execution: Execution::Conditional { branches },
            ttl_secs: 0,
            notify: false,
        }
    }

    /// A step that routes onward as soon as a user enters
    pub fn direct(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            execution: Execution::Direct {
                target: target.into(),
            },
            ttl_secs: 0,
            notify: false,
        }
    }

    /// A step driven by a schedule instead of user events
    pub fn timer(
        name: impl Into<String>,
        interval_secs: u64,
        expr: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            execution: Execution::Timer {
                interval_secs,
                expr: expr.into(),
                target: target.into(),
            },
            ttl_secs: 0,
            notify: false,
        }
    }

    /// A terminal step: users arrive and stay
    pub fn sink(name: impl Into<String>) -> Self {
        Self::conditional(name, Vec::new())
    }

    /// Mark transitions into this step as externally visible
    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    /// Bound how long a user may sit in this step
    pub fn with_ttl(mut self, ttl_secs: u32) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// All step names this step can route to
    pub fn targets(&self) -> Vec<&str> {
        match &self.execution {
            Execution::Timer { target, .. } => vec![target.as_str()],
            Execution::Direct { target } => vec![target.as_str()],
            Execution::Conditional { branches } => {
                branches.iter().map(|b| b.target.as_str()).collect()
            }
        }
    }

    /// A step with no outgoing edges
    pub fn is_terminal(&self) -> bool {
        self.targets().is_empty()
    }

    /// A step that fires as soon as a user enters
    pub fn is_direct(&self) -> bool {
        matches!(self.execution, Execution::Direct { .. })
    }
}

/// The execution variant of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Execution {
    /// Fires on a fixed schedule; `expr` selects the users to move
    Timer {
        interval_secs: u64,
        expr: String,
        target: String,
    },

    /// Fires immediately on entry
    Direct { target: String },

    /// Fires when a user event arrives; first matching branch wins
    Conditional { branches: Vec<Branch> },
}

/// One guarded edge of a conditional step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Guard expression in the compact text form
    pub expr: String,

    /// Destination step when the guard holds
    pub target: String,
}

impl Branch {
    pub fn new(expr: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_workflow() -> Workflow {
        Workflow::new(1, 100, "signup")
            .with_step(Step::conditional(
                "a",
                vec![Branch::new("uid % 2 == 0", "b")],
            ))
            .with_step(Step::sink("b"))
    }

    #[test]
    fn test_validate_ok() {
        assert!(two_step_workflow().validate().is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let wf = Workflow::new(1, 100, "empty");
        assert!(matches!(wf.validate(), Err(MetaError::MissingField(_))));
    }

    #[test]
    fn test_validate_duplicate_step() {
        let wf = Workflow::new(1, 100, "dup")
            .with_step(Step::sink("a"))
            .with_step(Step::sink("a"));
        assert!(matches!(wf.validate(), Err(MetaError::DuplicateStep(_))));
    }

    #[test]
    fn test_validate_unknown_target() {
        let wf = Workflow::new(1, 100, "dangling").with_step(Step::direct("a", "nowhere"));
        assert!(matches!(
            wf.validate(),
            Err(MetaError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_validate_direct_cycle() {
        let wf = Workflow::new(1, 100, "cycle")
            .with_step(Step::direct("a", "b"))
            .with_step(Step::direct("b", "a"));
        assert!(matches!(wf.validate(), Err(MetaError::DirectCycle(_))));
    }

    #[test]
    fn test_validate_direct_chain_into_sink() {
        let wf = Workflow::new(1, 100, "chain")
            .with_step(Step::direct("a", "b"))
            .with_step(Step::direct("b", "c"))
            .with_step(Step::sink("c"));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_step_predicates() {
        let wf = two_step_workflow();
        assert!(!wf.steps[0].is_terminal());
        assert!(wf.steps[1].is_terminal());
        assert!(Step::direct("x", "y").is_direct());
    }

    #[test]
    fn test_serde_roundtrip() {
        let wf = two_step_workflow().with_duration(3600);
        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(wf, back);
    }
}
