//! Storage contract for hiveflow
//!
//! The engine runs on top of a replicated key-value store with
//! Raft-per-shard semantics: plain KV operations with optional TTL, prefix
//! scans, a typed command interface whose effects come back as events on a
//! watch stream, and per-tenant partitioned queues with consumer groups.
//!
//! This crate defines that contract (`Storage`, `StoreCommand`,
//! `StorageEvent`) plus `MemoryStorage`, the in-process reference backend
//! used by tests and `hiveflow serve`. A production deployment swaps in a
//! backend that forwards commands to the replicated store; the engine only
//! ever talks to the trait.

pub mod command;
pub mod error;
pub mod keys;
pub mod memory;
mod queue;
pub mod storage;

pub use command::{
    Condition, ConditionGroup, CommandResponse, IdRange, OffsetCommit, QueueFetchResult,
    QueueJoinResult, StoreCommand, StorageEvent,
};
pub use error::{Result, StorageError};
pub use memory::MemoryStorage;
pub use storage::{decode, encode, Storage, WORKER_GROUP};
