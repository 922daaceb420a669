//! Consumer-group bookkeeping for the partitioned queues

use serde::{Deserialize, Serialize};

/// Which of the two per-tenant queues a key addresses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum QueueKind {
    /// Events flowing into the engine
    Input,
    /// Notifications flowing out of the engine
    Output,
}

impl QueueKind {
    /// Stable single-byte tag used in key encoding
    pub fn tag(self) -> u8 {
        match self {
            QueueKind::Input => b'i',
            QueueKind::Output => b'o',
        }
    }
}

/// Assignment of one partition to a consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartitionState {
    /// Consumer index owning this partition
    pub consumer: u32,

    /// Fencing version; stale consumers present an old version and are
    /// rejected
    pub version: u64,

    /// Unix seconds of the owner's last fetch, for liveness eviction
    pub last_fetch_ts: i64,
}

/// State of one consumer group over a tenant queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// Partition count of the queue
    pub partitions: u32,

    /// Number of consumers currently in the group
    pub consumers: u32,

    /// One entry per partition
    #[serde(default)]
    pub states: Vec<PartitionState>,

    /// Seconds without a fetch before a consumer is evicted; 0 = disabled
    #[serde(default)]
    pub timeout_secs: u64,
}

impl QueueState {
    /// Fresh group state for a queue with `partitions` partitions
    pub fn new(partitions: u32, timeout_secs: u64) -> Self {
        Self {
            partitions,
            consumers: 0,
            states: (0..partitions).map(|_| PartitionState::default()).collect(),
            timeout_secs,
        }
    }

    /// Partitions assigned to `consumer` under round-robin assignment
    pub fn partitions_of(&self, consumer: u32) -> Vec<u32> {
        if self.consumers == 0 {
            return Vec::new();
        }
        (0..self.partitions)
            .filter(|p| p % self.consumers == consumer)
            .collect()
    }
}
