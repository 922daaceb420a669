//! Partitioned queue operations
//!
//! Each tenant owns an input and an output queue, both split into
//! partitions with independent offset spaces starting at 1. Consumer groups
//! share a queue through versioned partition assignments: a consumer that
//! presents a stale version is told to rejoin, and a consumer that stops
//! fetching past the group timeout is evicted by whichever fetch observes
//! it first. Appends opportunistically garbage-collect items every live
//! group has committed past.

use crate::command::{QueueFetchResult, QueueJoinResult};
use crate::error::{Result, StorageError};
use crate::keys;
use crate::memory::{now_unix, Entry, MemoryStorage};
use crate::storage::{decode, encode};
use hiveflow_meta::{QueueKind, QueueState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// GC runs once the uncollected backlog exceeds this many items
pub(crate) const COUNT_TO_CLEAN: u64 = 4096;

/// Commits older than this mark a consumer as abandoned for GC purposes
pub(crate) const MAX_CONSUMER_ALIVE_SECS: i64 = 7 * 24 * 60 * 60;

/// Consumer-liveness timeout for freshly provisioned queues
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A group's committed position on one partition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommitRecord {
    pub offset: u64,
    pub ts: i64,
}

pub(crate) fn ensure_commit_record(
    map: &mut BTreeMap<Vec<u8>, Entry>,
    partition_key: &str,
    group: &str,
    now: i64,
) {
    let key = keys::queue_commit(partition_key, group);
    if MemoryStorage::read_live(map, &key, now).is_none() {
        let record = CommitRecord { offset: 0, ts: now };
        MemoryStorage::write(map, key, serde_json::to_vec(&record).expect("commit record"));
    }
}

fn read_u64(map: &BTreeMap<Vec<u8>, Entry>, key: &[u8], now: i64) -> u64 {
    MemoryStorage::read_live(map, key, now)
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn write_u64(map: &mut BTreeMap<Vec<u8>, Entry>, key: Vec<u8>, value: u64) {
    MemoryStorage::write(map, key, value.to_string().into_bytes());
}

/// Drop every assignment in the group; all members must rejoin
fn reset_membership(state: &mut QueueState) {
    state.consumers = 0;
    for partition in &mut state.states {
        partition.version += 1;
    }
}

/// Evict expired consumers; returns true when the membership was reset
fn sweep_expired(state: &mut QueueState, now: i64) -> bool {
    if state.timeout_secs == 0 || state.consumers == 0 {
        return false;
    }

    let expired = state
        .states
        .iter()
        .any(|p| now - p.last_fetch_ts > state.timeout_secs as i64);
    if expired {
        reset_membership(state);
    }
    expired
}

impl MemoryStorage {
    fn load_group_state(
        map: &BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        group: &str,
        now: i64,
    ) -> Result<Option<QueueState>> {
        match Self::read_live(map, &keys::queue_group_state(tenant, kind, group), now) {
            Some(data) => Ok(Some(decode("queue group state", &data)?)),
            None => Ok(None),
        }
    }

    fn save_group_state(
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        group: &str,
        state: &QueueState,
    ) -> Result<()> {
        Self::write(
            map,
            keys::queue_group_state(tenant, kind, group),
            encode(state)?,
        );
        Ok(())
    }

    /// Append `items`, then GC if the backlog is large enough
    pub(crate) fn queue_add(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        items: Vec<Vec<u8>>,
    ) -> Result<u64> {
        let now = now_unix();
        let pk = keys::partition(tenant, kind, partition);
        let max_key = keys::queue_max_offset(&pk);
        let mut max_offset = read_u64(map, &max_key, now);

        for item in items {
            max_offset += 1;
            Self::write(map, keys::queue_item(&pk, max_offset), item);
        }
        write_u64(map, max_key, max_offset);

        self.maybe_collect(map, &pk, max_offset, now);
        Ok(max_offset)
    }

    /// Range-delete `[removed+1, low]` when every live group has committed
    /// beyond `low`
    fn maybe_collect(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        pk: &str,
        max_offset: u64,
        now: i64,
    ) {
        let removed_key = keys::queue_removed_offset(pk);
        let removed = read_u64(map, &removed_key, now);
        if max_offset - removed <= COUNT_TO_CLEAN {
            return;
        }

        let (start, end) = keys::queue_commit_range(pk);
        let mut low = u64::MAX;
        let mut seen = false;
        let commits: Vec<Vec<u8>> = map
            .range(start..end)
            .filter(|(_, e)| e.expires_at == 0 || now < e.expires_at)
            .map(|(_, e)| e.value.clone())
            .collect();
        for data in commits {
            let Ok(record) = serde_json::from_slice::<CommitRecord>(&data) else {
                continue;
            };
            // consumers quiet for a week no longer hold back collection
            if now - record.ts < MAX_CONSUMER_ALIVE_SECS && record.offset < low {
                low = record.offset;
                seen = true;
            }
        }

        if !seen || low <= removed {
            return;
        }

        let low = low.min(max_offset);
        for offset in removed + 1..=low {
            map.remove(&keys::queue_item(pk, offset));
        }
        write_u64(map, removed_key, low);
        debug!(partition = pk, removed = low, "queue garbage collected");
    }

    /// Join a consumer group; committed offsets survive rejoin
    pub(crate) fn queue_join(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        group: &str,
    ) -> Result<QueueJoinResult> {
        let now = now_unix();
        let meta = Self::read_live(map, &keys::queue_meta(tenant, kind), now)
            .ok_or_else(|| StorageError::NotFound(format!("queue meta for tenant {tenant}")))?;
        let meta: QueueState = decode("queue meta", &meta)?;

        let mut state = Self::load_group_state(map, tenant, kind, group, now)?
            .unwrap_or_else(|| QueueState::new(meta.partitions, meta.timeout_secs));

        sweep_expired(&mut state, now);

        let index = state.consumers;
        state.consumers += 1;

        // round-robin reassignment; moved partitions get a new version
        for (p, partition) in state.states.iter_mut().enumerate() {
            let owner = p as u32 % state.consumers;
            if partition.consumer != owner {
                partition.consumer = owner;
                partition.version += 1;
            }
            partition.last_fetch_ts = now;
        }

        for p in 0..state.partitions {
            let pk = keys::partition(tenant, kind, p);
            ensure_commit_record(map, &pk, group, now);
        }

        let partitions = state.partitions_of(index);
        let versions = partitions
            .iter()
            .map(|p| state.states[*p as usize].version)
            .collect();

        Self::save_group_state(map, tenant, kind, group, &state)?;
        Ok(QueueJoinResult {
            index,
            partitions,
            versions,
        })
    }

    /// Fetch up to `count` items or `max_bytes` bytes past the group's
    /// committed offset
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_fetch(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        group: &str,
        consumer: u32,
        version: u64,
        count: usize,
        max_bytes: usize,
    ) -> Result<QueueFetchResult> {
        let now = now_unix();
        let removed_result = QueueFetchResult {
            removed: true,
            items: Vec::new(),
            last_offset: 0,
        };

        let Some(mut state) = Self::load_group_state(map, tenant, kind, group, now)? else {
            return Ok(removed_result);
        };
        if consumer >= state.consumers || partition >= state.partitions {
            return Ok(removed_result);
        }

        if sweep_expired(&mut state, now) {
            Self::save_group_state(map, tenant, kind, group, &state)?;
            return Ok(removed_result);
        }

        let assignment = &mut state.states[partition as usize];
        if assignment.consumer != consumer || assignment.version != version {
            return Ok(removed_result);
        }
        assignment.last_fetch_ts = now;
        Self::save_group_state(map, tenant, kind, group, &state)?;

        let pk = keys::partition(tenant, kind, partition);
        let committed = Self::read_live(map, &keys::queue_commit(&pk, group), now)
            .and_then(|data| serde_json::from_slice::<CommitRecord>(&data).ok())
            .map(|r| r.offset)
            .unwrap_or(0);
        let removed_offset = read_u64(map, &keys::queue_removed_offset(&pk), now);
        let max_offset = read_u64(map, &keys::queue_max_offset(&pk), now);

        let mut items = Vec::new();
        let mut last_offset = 0;
        let mut bytes = 0usize;
        for offset in committed.max(removed_offset) + 1..=max_offset {
            let Some(item) = Self::read_live(map, &keys::queue_item(&pk, offset), now) else {
                continue;
            };
            if !items.is_empty() && bytes + item.len() > max_bytes {
                break;
            }
            bytes += item.len();
            last_offset = offset;
            items.push(item);
            if items.len() >= count {
                break;
            }
        }

        Ok(QueueFetchResult {
            removed: false,
            items,
            last_offset,
        })
    }

    /// Record a group's completed offset; smaller offsets are ignored
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_commit(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        kind: QueueKind,
        partition: u32,
        group: &str,
        consumer: u32,
        version: u64,
        offset: u64,
    ) -> Result<()> {
        let now = now_unix();
        let state = Self::load_group_state(map, tenant, kind, group, now)?
            .ok_or_else(|| StorageError::NotFound(format!("consumer group {group}")))?;
        if partition >= state.partitions {
            return Err(StorageError::Conflict(format!(
                "partition {partition} out of range"
            )));
        }

        let assignment = &state.states[partition as usize];
        if consumer >= state.consumers
            || assignment.consumer != consumer
            || assignment.version != version
        {
            return Err(StorageError::Conflict(format!(
                "consumer {consumer}@{version} no longer owns partition {partition}"
            )));
        }

        let pk = keys::partition(tenant, kind, partition);
        let key = keys::queue_commit(&pk, group);
        let current = Self::read_live(map, &key, now)
            .and_then(|data| serde_json::from_slice::<CommitRecord>(&data).ok())
            .map(|r| r.offset)
            .unwrap_or(0);

        let record = CommitRecord {
            offset: current.max(offset),
            ts: now,
        };
        Self::write(map, key, encode(&record)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResponse, StoreCommand};
    use crate::storage::{Storage, WORKER_GROUP};

    async fn init_tenant(store: &MemoryStorage, tenant: u64, partitions: u32) {
        store
            .exec_command(StoreCommand::TenantInit {
                tenant,
                input_partitions: partitions,
                output_partitions: partitions,
            })
            .await
            .unwrap();
    }

    /// Shrink a group's liveness timeout so eviction tests run fast
    async fn set_group_timeout(store: &MemoryStorage, tenant: u64, group: &str, timeout: u64) {
        let key = keys::queue_group_state(tenant, QueueKind::Input, group);
        let data = store.get(&key).await.unwrap().unwrap();
        let mut state: QueueState = serde_json::from_slice(&data).unwrap();
        state.timeout_secs = timeout;
        store.set(&key, serde_json::to_vec(&state).unwrap()).await.unwrap();
    }

    async fn fetch(
        store: &MemoryStorage,
        tenant: u64,
        partition: u32,
        group: &str,
        consumer: u32,
        version: u64,
    ) -> QueueFetchResult {
        let resp = store
            .exec_command(StoreCommand::QueueFetch {
                tenant,
                kind: QueueKind::Input,
                partition,
                group: group.to_string(),
                consumer,
                version,
                count: 100,
                max_bytes: 1 << 20,
            })
            .await
            .unwrap();
        match resp {
            CommandResponse::Fetch(result) => result,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    async fn join(store: &MemoryStorage, tenant: u64, group: &str) -> QueueJoinResult {
        let resp = store
            .exec_command(StoreCommand::QueueJoinGroup {
                tenant,
                kind: QueueKind::Input,
                group: group.to_string(),
            })
            .await
            .unwrap();
        match resp {
            CommandResponse::Join(result) => result,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_and_fetch_in_order() {
        let store = MemoryStorage::new();
        init_tenant(&store, 10, 2).await;

        let max = store
            .put_to_queue(
                10,
                QueueKind::Input,
                0,
                vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
            )
            .await
            .unwrap();
        assert_eq!(max, 3);

        // the provisioned worker group fetches with identity assignment
        let result = fetch(&store, 10, 0, WORKER_GROUP, 0, 0).await;
        assert!(!result.removed);
        assert_eq!(result.items, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(result.last_offset, 3);
    }

    #[tokio::test]
    async fn test_put_to_queue_alloc_round_robin() {
        let store = MemoryStorage::new();
        init_tenant(&store, 10, 3).await;

        store
            .put_to_queue_alloc(
                10,
                QueueKind::Input,
                vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
            )
            .await
            .unwrap();

        for p in 0..3 {
            let result = fetch(&store, 10, p, WORKER_GROUP, p, 0).await;
            assert_eq!(result.items.len(), 1, "partition {p}");
        }
    }

    #[tokio::test]
    async fn test_put_to_queue_with_kv() {
        let store = MemoryStorage::new();
        init_tenant(&store, 10, 1).await;

        store
            .put_to_queue_with_kv(
                10,
                QueueKind::Input,
                0,
                vec![b"event".to_vec()],
                vec![(b"key1".to_vec(), b"value1".to_vec())],
            )
            .await
            .unwrap();

        assert_eq!(store.get(b"key1").await.unwrap(), Some(b"value1".to_vec()));
        let result = fetch(&store, 10, 0, WORKER_GROUP, 0, 0).await;
        assert_eq!(result.items, vec![b"event".to_vec()]);
    }

    #[tokio::test]
    async fn test_fetch_max_bytes() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 1).await;
        store
            .put_to_queue(
                1,
                QueueKind::Input,
                0,
                vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
            )
            .await
            .unwrap();

        let resp = store
            .exec_command(StoreCommand::QueueFetch {
                tenant: 1,
                kind: QueueKind::Input,
                partition: 0,
                group: WORKER_GROUP.to_string(),
                consumer: 0,
                version: 0,
                count: 3,
                max_bytes: 2,
            })
            .await
            .unwrap();
        let CommandResponse::Fetch(result) = resp else {
            panic!("unexpected response");
        };
        assert!(!result.removed);
        assert_eq!(result.items.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_advances_fetch_position() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 1).await;
        store
            .put_to_queue(1, QueueKind::Input, 0, vec![b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap();

        let result = fetch(&store, 1, 0, WORKER_GROUP, 0, 0).await;
        assert_eq!(result.items.len(), 2);

        store
            .exec_command(StoreCommand::QueueCommit {
                tenant: 1,
                kind: QueueKind::Input,
                partition: 0,
                group: WORKER_GROUP.to_string(),
                consumer: 0,
                version: 0,
                offset: result.last_offset,
            })
            .await
            .unwrap();

        // nothing new: empty fetch
        let result = fetch(&store, 1, 0, WORKER_GROUP, 0, 0).await;
        assert!(result.items.is_empty());

        store
            .put_to_queue(1, QueueKind::Input, 0, vec![b"c".to_vec()])
            .await
            .unwrap();
        let result = fetch(&store, 1, 0, WORKER_GROUP, 0, 0).await;
        assert_eq!(result.items, vec![b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 1).await;
        store
            .put_to_queue(1, QueueKind::Input, 0, vec![b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap();

        for offset in [2u64, 1] {
            store
                .exec_command(StoreCommand::QueueCommit {
                    tenant: 1,
                    kind: QueueKind::Input,
                    partition: 0,
                    group: WORKER_GROUP.to_string(),
                    consumer: 0,
                    version: 0,
                    offset,
                })
                .await
                .unwrap();
        }

        // the smaller commit was ignored; fetch starts after offset 2
        let result = fetch(&store, 1, 0, WORKER_GROUP, 0, 0).await;
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unknown_group_is_removed() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 2).await;

        let result = fetch(&store, 1, 0, "nobody", 0, 0).await;
        assert!(result.removed);
    }

    #[tokio::test]
    async fn test_fetch_invalid_consumer_and_partition() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 2).await;
        join(&store, 1, "g1").await;

        let result = fetch(&store, 1, 0, "g1", 5, 0).await;
        assert!(result.removed);

        let result = fetch(&store, 1, 9, "g1", 0, 0).await;
        assert!(result.removed);
    }

    #[tokio::test]
    async fn test_join_assigns_all_partitions_to_first_consumer() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 2).await;

        let result = join(&store, 1, "g1").await;
        assert_eq!(result.index, 0);
        assert_eq!(result.partitions, vec![0, 1]);
        assert_eq!(result.versions.len(), 2);

        let second = join(&store, 1, "g1").await;
        assert_eq!(second.index, 1);
        assert_eq!(second.partitions, vec![1]);
    }

    #[tokio::test]
    async fn test_consumer_failover() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 2).await;

        let c0 = join(&store, 1, "g1").await;
        let c1 = join(&store, 1, "g1").await;
        // the second join rebalanced: consumer 0 now owns partition 0 only
        assert_eq!(c0.index, 0);
        assert_eq!(c1.partitions, vec![1]);

        // both consumers commit progress
        store
            .put_to_queue(1, QueueKind::Input, 0, vec![b"a".to_vec()])
            .await
            .unwrap();
        store
            .exec_command(StoreCommand::QueueCommit {
                tenant: 1,
                kind: QueueKind::Input,
                partition: 0,
                group: "g1".to_string(),
                consumer: 0,
                version: c0.versions[0],
                offset: 1,
            })
            .await
            .unwrap();

        // consumer 0 goes quiet past the timeout
        set_group_timeout(&store, 1, "g1", 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        // its own next fetch observes the eviction
        let result = fetch(&store, 1, 0, "g1", c0.index, c0.versions[0]).await;
        assert!(result.removed);

        // consumer 1 is fenced out too and rejoins, receiving both
        // partitions with the committed offset preserved
        let result = fetch(&store, 1, 1, "g1", c1.index, c1.versions[0]).await;
        assert!(result.removed);

        let rejoined = join(&store, 1, "g1").await;
        assert_eq!(rejoined.index, 0);
        assert_eq!(rejoined.partitions, vec![0, 1]);

        let result = fetch(&store, 1, 0, "g1", rejoined.index, rejoined.versions[0]).await;
        assert!(!result.removed);
        assert!(result.items.is_empty(), "offset 1 already committed");

        // a return attempt from the evicted consumer stays rejected
        let result = fetch(&store, 1, 0, "g1", c0.index, c0.versions[0]).await;
        assert!(result.removed);
    }

    #[tokio::test]
    async fn test_gc_removes_only_committed_items() {
        let store = MemoryStorage::new();
        init_tenant(&store, 1, 1).await;

        let batch: Vec<Vec<u8>> = (0..COUNT_TO_CLEAN + 10).map(|i| i.to_string().into_bytes()).collect();
        store
            .put_to_queue(1, QueueKind::Input, 0, batch)
            .await
            .unwrap();

        // nothing committed yet: backlog over threshold but low == 0
        let pk = keys::partition(1, QueueKind::Input, 0);
        assert!(store
            .get(&keys::queue_item(&pk, 1))
            .await
            .unwrap()
            .is_some());

        store
            .exec_command(StoreCommand::QueueCommit {
                tenant: 1,
                kind: QueueKind::Input,
                partition: 0,
                group: WORKER_GROUP.to_string(),
                consumer: 0,
                version: 0,
                offset: 100,
            })
            .await
            .unwrap();

        // next append triggers collection up to the committed offset
        store
            .put_to_queue(1, QueueKind::Input, 0, vec![b"x".to_vec()])
            .await
            .unwrap();

        assert!(store.get(&keys::queue_item(&pk, 1)).await.unwrap().is_none());
        assert!(store.get(&keys::queue_item(&pk, 100)).await.unwrap().is_none());
        assert!(store.get(&keys::queue_item(&pk, 101)).await.unwrap().is_some());

        // fetch never returns collected offsets; offset 101 holds item "100"
        let result = fetch(&store, 1, 0, WORKER_GROUP, 0, 0).await;
        assert!(!result.removed);
        assert_eq!(result.items[0], b"100".to_vec());
    }
}
