//! Typed storage commands, responses, and the event stream
//!
//! A command is the unit of replication: the backend applies it atomically
//! and, for the lifecycle verbs, pushes a `StorageEvent` to every watcher.
//! Controllers never mutate their in-memory picture directly; they submit a
//! command and react to the event when it comes back.

use hiveflow_meta::{IdSet, Notify, QueueKind, WorkerState, WorkflowInstance};
use serde::{Deserialize, Serialize};

/// A conditional-write predicate against the current value of a key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    /// The key exists
    Exists,
    /// The key does not exist
    NotExists,
    /// The current value equals the operand
    Equal(Vec<u8>),
    /// The current value differs from the operand
    NotEqual(Vec<u8>),
}

/// A conjunction of conditions; groups are alternatives (OR of ANDs)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionGroup {
    pub conditions: Vec<Condition>,
}

/// Offset commit piggybacked on a shard-state write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OffsetCommit {
    pub tenant: u64,
    pub kind: QueueKind,
    pub partition: u32,
    pub group: String,
    pub consumer: u32,
    pub version: u64,
    pub offset: u64,
}

/// The command vocabulary of the replicated store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum StoreCommand {
    // --- instance lifecycle ---
    /// Record a new instance in `Starting` state
    StartingInstance { instance: WorkflowInstance },

    /// All shards created; move the instance to `Running`
    StartedInstance { workflow_id: u64 },

    /// Request teardown; move the instance to `Stopping`
    StopInstance { workflow_id: u64 },

    /// Teardown finished; move the instance to `Stopped`
    StoppedInstance { workflow_id: u64 },

    /// Create one worker shard's state record
    CreateInstanceStateShard { state: WorkerState },

    /// Atomically replace a shard's state, write sharded crowd chunks,
    /// append output notifications, and commit the consumer offset
    UpdateInstanceStateShard {
        state: WorkerState,
        expect_version: u64,
        #[serde(default)]
        crowd_chunks: Vec<(Vec<u8>, Vec<u8>)>,
        #[serde(default)]
        notifies: Vec<Notify>,
        #[serde(default)]
        offset: Option<OffsetCommit>,
    },

    /// Delete one worker shard's state record
    RemoveInstanceStateShard { workflow_id: u64, index: u32 },

    // --- conditional KV ---
    SetIf {
        key: Vec<u8>,
        value: Vec<u8>,
        conditions: Vec<ConditionGroup>,
    },
    DeleteIf {
        key: Vec<u8>,
        conditions: Vec<ConditionGroup>,
    },

    // --- ID allocation ---
    AllocId { key: Vec<u8>, batch: u32 },
    ResetId { key: Vec<u8>, start_with: u32 },

    // --- server-side bitmaps ---
    BmCreate { key: Vec<u8>, ids: Vec<u32> },
    BmAdd { key: Vec<u8>, ids: Vec<u32> },
    BmRemove { key: Vec<u8>, ids: Vec<u32> },
    BmClear { key: Vec<u8> },
    BmContains { key: Vec<u8>, ids: Vec<u32> },
    BmCount { key: Vec<u8> },
    BmRange { key: Vec<u8>, start: u32, limit: u64 },

    // --- queues ---
    QueueAdd {
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        items: Vec<Vec<u8>>,
        /// KV pairs written atomically with the append
        #[serde(default)]
        kv: Vec<(Vec<u8>, Vec<u8>)>,
    },
    QueueJoinGroup {
        tenant: u64,
        kind: QueueKind,
        group: String,
    },
    QueueFetch {
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        group: String,
        consumer: u32,
        version: u64,
        count: usize,
        max_bytes: usize,
    },
    QueueCommit {
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        group: String,
        consumer: u32,
        version: u64,
        offset: u64,
    },

    // --- tenants and mappings ---
    /// Provision a tenant's input/output queues and the internal worker
    /// consumer group
    TenantInit {
        tenant: u64,
        input_partitions: u32,
        output_partitions: u32,
    },
    UpdateMapping {
        tenant: u64,
        user_id: u32,
        set: IdSet,
    },
    GetMapping { tenant: u64, user_id: u32 },
}

/// Result of a queue fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueFetchResult {
    /// The caller's assignment is stale; it must rejoin before fetching
    pub removed: bool,

    /// Fetched items, in offset order
    pub items: Vec<Vec<u8>>,

    /// Offset of the last returned item; commit this after processing
    pub last_offset: u64,
}

/// Result of joining a consumer group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueJoinResult {
    /// The caller's consumer index within the group
    pub index: u32,

    /// Partitions assigned to the caller
    pub partitions: Vec<u32>,

    /// Fencing version per assigned partition
    pub versions: Vec<u64>,
}

/// An allocated ID range, inclusive on both ends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdRange {
    pub from: u32,
    pub to: u32,
}

/// Response to a storage command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum CommandResponse {
    Ok,
    Bool(bool),
    Uint64(u64),
    Uint32Slice(Vec<u32>),
    IdRange(IdRange),
    Fetch(QueueFetchResult),
    Join(QueueJoinResult),
    IdSet(IdSet),
}

impl CommandResponse {
    /// Unwrap a boolean response
    pub fn into_bool(self) -> bool {
        matches!(self, CommandResponse::Bool(true))
    }
}

/// Server-push events reflecting applied lifecycle commands
///
/// The event stream is the single source of truth for instance and shard
/// transitions; any node (not just the submitter) observes them.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// A `StartingInstance` command was applied
    StartingInstance(WorkflowInstance),

    /// The instance moved to `Running`
    RunningInstance(WorkflowInstance),

    /// The instance moved to `Stopping`
    StoppingInstance(WorkflowInstance),

    /// The instance moved to `Stopped`
    StoppedInstance { workflow_id: u64, instance_id: u64 },

    /// A worker shard was placed on this node
    RunningInstanceWorker(WorkerState),

    /// A worker shard was removed
    RemoveInstanceWorker(WorkerState),
}
