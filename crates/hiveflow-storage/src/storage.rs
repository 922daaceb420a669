//! The storage trait the engine consumes

use crate::command::{CommandResponse, IdRange, StoreCommand, StorageEvent};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use hiveflow_meta::QueueKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

/// Consumer group used internally by the shard workers
///
/// Provisioned by `TenantInit` with one consumer per partition and liveness
/// eviction disabled; shard `i` always fetches partition `i`.
pub const WORKER_GROUP: &str = "workers";

/// Encode a record for persistence
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a persisted record, naming the key on failure
pub fn decode<T: DeserializeOwned>(key_desc: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|_| StorageError::Corrupted(key_desc.to_string()))
}

/// Storage backend trait for hiveflow
///
/// Implementations provide replicated KV with TTL, prefix scans, atomic
/// typed commands, the lifecycle event stream, and the partitioned queues.
/// The trait is object-safe and used as `Arc<dyn Storage>`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get a value; `None` when the key is absent or its TTL expired
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Set a value
    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Set a value that expires after `ttl_secs` (0 = no expiry)
    async fn set_with_ttl(&self, key: &[u8], value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Scan `[start, end)` in key order, up to `limit` entries
    async fn scan(&self, start: &[u8], end: &[u8], limit: usize)
        -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a typed command atomically
    async fn exec_command(&self, cmd: StoreCommand) -> Result<CommandResponse>;

    /// Subscribe to the lifecycle event stream
    fn watch_events(&self) -> broadcast::Receiver<StorageEvent>;

    /// Append items to one partition of a tenant queue
    async fn put_to_queue(
        &self,
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        items: Vec<Vec<u8>>,
    ) -> Result<u64> {
        self.put_to_queue_with_kv(tenant, kind, partition, items, Vec::new())
            .await
    }

    /// Append items and write KV pairs in one atomic command
    async fn put_to_queue_with_kv(
        &self,
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        items: Vec<Vec<u8>>,
        kv: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<u64> {
        match self
            .exec_command(StoreCommand::QueueAdd {
                tenant,
                kind,
                partition,
                items,
                kv,
            })
            .await?
        {
            CommandResponse::Uint64(max_offset) => Ok(max_offset),
            other => Err(StorageError::Backend(format!(
                "unexpected queue add response: {other:?}"
            ))),
        }
    }

    /// Append items across partitions, round-robin by allocated sequence
    async fn put_to_queue_alloc(
        &self,
        tenant: u64,
        kind: QueueKind,
        items: Vec<Vec<u8>>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let meta_key = crate::keys::queue_meta(tenant, kind);
        let meta = self
            .get(&meta_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("queue meta for tenant {tenant}")))?;
        let state: hiveflow_meta::QueueState = decode("queue meta", &meta)?;

        let alloc_key = format!("queue/alloc/{tenant}/{}", kind.tag() as char).into_bytes();
        let range = self.alloc_id(&alloc_key, items.len() as u32).await?;

        for (i, item) in items.into_iter().enumerate() {
            let seq = range.from as u64 + i as u64 - 1;
            let partition = (seq % state.partitions as u64) as u32;
            self.put_to_queue(tenant, kind, partition, vec![item]).await?;
        }
        Ok(())
    }

    /// Allocate `batch` IDs under `key`; returns the inclusive range
    async fn alloc_id(&self, key: &[u8], batch: u32) -> Result<IdRange> {
        match self
            .exec_command(StoreCommand::AllocId {
                key: key.to_vec(),
                batch,
            })
            .await?
        {
            CommandResponse::IdRange(range) => Ok(range),
            other => Err(StorageError::Backend(format!(
                "unexpected alloc response: {other:?}"
            ))),
        }
    }
}
