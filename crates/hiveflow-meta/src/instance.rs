//! Instance and worker-shard state records

use crate::workflow::{Step, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which loader materializes a crowd bitmap from its metadata
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LoaderKind {
    /// The metadata is the serialized bitmap itself
    Raw,
    /// The metadata is a KV key holding the serialized bitmap (read-only)
    Kv,
    /// The metadata describes a chunked bitmap under a key prefix
    ShardedKv,
}

/// Lifecycle state of a workflow instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    /// Accepted; worker shards are being created
    #[default]
    Starting,
    /// All shards created; workers consume events
    Running,
    /// Stop requested; snapshot and teardown in progress
    Stopping,
    /// Fully stopped; only the history snapshot remains
    Stopped,
}

/// One running incarnation of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    /// Unique instance ID, allocated from the store's ID service
    pub instance_id: u64,

    /// The workflow version this instance executes; updates arrive as
    /// in-band `UpdateWorkflow` events so replay stays deterministic
    pub snapshot: Workflow,

    /// Loader for the instance's full initial crowd
    pub loader: LoaderKind,

    /// Opaque loader metadata
    #[serde(with = "serde_bytes")]
    pub loader_meta: Vec<u8>,

    /// Cached cardinality of the initial crowd
    pub total_crowd: u64,

    /// Target shard count
    pub workers: u32,

    /// Lifecycle state
    #[serde(default)]
    pub state: InstanceState,

    /// When the instance entered Running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the instance entered Stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn workflow_id(&self) -> u64 {
        self.snapshot.id
    }

    pub fn tenant_id(&self) -> u64 {
        self.snapshot.tenant_id
    }

    pub fn is_stopped(&self) -> bool {
        self.state == InstanceState::Stopped
    }
}

/// Per-step membership within one worker shard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// The step definition this crowd belongs to
    pub step: Step,

    /// Loader for the step's crowd
    pub loader: LoaderKind,

    /// Opaque loader metadata
    #[serde(with = "serde_bytes")]
    pub loader_meta: Vec<u8>,

    /// Cached cardinality of the step's crowd
    pub total_crowd: u64,
}

/// One shard of a workflow instance
///
/// Invariant: the per-step crowds are pairwise disjoint and their union is
/// this shard's portion of the instance's current total crowd. Exactly one
/// worker mutates this record at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub tenant_id: u64,
    pub workflow_id: u64,
    pub instance_id: u64,

    /// Shard index in `[0, workers)`
    pub index: u32,

    /// Routing range: this shard owns user IDs in `[start, end)`
    pub start: u32,
    pub end: u32,

    /// Absolute unix-second deadline after which the shard stops; 0 = none
    #[serde(default)]
    pub stop_at: i64,

    /// Conditional-write fencing version, bumped on every commit
    #[serde(default)]
    pub version: u64,

    /// One entry per workflow step, in step order
    pub states: Vec<StepState>,
}

impl WorkerState {
    /// The registry key for this shard's worker
    pub fn worker_key(&self) -> String {
        format!("{}/{}", self.instance_id, self.index)
    }

    /// Whether a user ID routes to this shard
    pub fn covers(&self, user_id: u32) -> bool {
        user_id >= self.start && user_id < self.end
    }
}

/// Final crowd of one step, recorded in the history snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepCrowd {
    pub name: String,

    /// Serialized bitmap: union of the step's crowd across all shards
    #[serde(with = "serde_bytes")]
    pub crowd: Vec<u8>,

    pub total_crowd: u64,
}

/// Immutable history record written when an instance stops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// The instance metadata with `state = Stopped`
    pub instance: WorkflowInstance,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Final per-step crowds, union across shards
    pub states: Vec<StepCrowd>,
}

/// Per-step cardinality of a running instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CountState {
    pub step: String,
    pub count: u64,
}

/// Aggregated cardinalities across all shards of an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCountState {
    pub total: u64,
    pub states: Vec<CountState>,
}

/// A step's aggregated crowd, returned as a loader reference instead of an
/// inline payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepCrowdRef {
    pub step: String,
    pub loader: LoaderKind,
    #[serde(with = "serde_bytes")]
    pub loader_meta: Vec<u8>,
    pub total_crowd: u64,
}
