//! Hiveflow metadata types
//!
//! The records shared by the storage layer and the engine: workflow
//! definitions, running instances, per-shard worker state, queue events and
//! consumer-group bookkeeping, and identity mappings. Everything here is
//! plain serde data; behavior lives in the engine.

pub mod error;
pub mod event;
pub mod instance;
pub mod mapping;
pub mod queue;
pub mod workflow;

pub use error::{MetaError, Result};
pub use event::{Event, Kv, Notify, UserEvent};
pub use instance::{
    CountState, InstanceCountState, InstanceSnapshot, InstanceState, LoaderKind, StepCrowd,
    StepCrowdRef, StepState, WorkerState, WorkflowInstance,
};
pub use mapping::{IdSet, IdValue};
pub use queue::{PartitionState, QueueKind, QueueState};
pub use workflow::{Branch, Execution, Step, Workflow};
