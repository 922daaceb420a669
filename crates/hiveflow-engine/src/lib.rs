//! Hiveflow engine
//!
//! A distributed workflow engine for crowd-scale state machines. A
//! workflow instance partitions a crowd of user IDs into shards; each
//! shard gets a single-writer state worker that consumes the shard's input
//! queue partition, evaluates guard expressions, and moves users between
//! per-step crowd bitmaps; the engine controller owns instance lifecycle
//! and reacts to the storage event stream.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Engine controller                   │
//! │  storage events ──► instance lifecycle ──► commands    │
//! │        │                                               │
//! │        ▼ shard placed                                  │
//! │  ┌────────────────────────────────────────────────┐    │
//! │  │ StateWorker (one per shard, single writer)     │    │
//! │  │  fetch ─► Transaction ─► atomic commit         │    │
//! │  │           step crowds     state+notify+offset  │    │
//! │  └────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod error;
pub mod metrics;
pub mod options;

mod shard;
mod step;
mod transaction;
mod worker;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use metrics::EngineMetrics;
pub use options::EngineOptions;
