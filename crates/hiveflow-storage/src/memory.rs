//! In-memory reference backend
//!
//! `MemoryStorage` implements the full storage contract in process: an
//! ordered map with TTL bookkeeping, atomic command application under one
//! write lock, and a broadcast event stream. Tests and `hiveflow serve` run
//! against it; a production backend replicates the same commands through
//! Raft and must preserve the same observable semantics.

use crate::command::{
    CommandResponse, Condition, ConditionGroup, IdRange, StoreCommand, StorageEvent,
};
use crate::error::{Result, StorageError};
use crate::keys;
use crate::storage::{decode, encode, Storage, WORKER_GROUP};
use async_trait::async_trait;
use hiveflow_meta::{IdSet, InstanceState, QueueKind, QueueState, WorkerState};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// One stored value with its expiry (unix seconds, 0 = never)
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub value: Vec<u8>,
    pub expires_at: i64,
}

impl Entry {
    fn live(&self, now: i64) -> bool {
        self.expires_at == 0 || now < self.expires_at
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-memory storage backend
pub struct MemoryStorage {
    pub(crate) map: RwLock<BTreeMap<Vec<u8>, Entry>>,
    pub(crate) events: broadcast::Sender<StorageEvent>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            map: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn emit(&self, event: StorageEvent) {
        // nobody listening is fine; the engine subscribes before starting
        let _ = self.events.send(event);
    }

    pub(crate) fn read_live(
        map: &BTreeMap<Vec<u8>, Entry>,
        key: &[u8],
        now: i64,
    ) -> Option<Vec<u8>> {
        map.get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone())
    }

    pub(crate) fn write(map: &mut BTreeMap<Vec<u8>, Entry>, key: Vec<u8>, value: Vec<u8>) {
        map.insert(
            key,
            Entry {
                value,
                expires_at: 0,
            },
        );
    }

    fn check_conditions(
        current: Option<&Vec<u8>>,
        groups: &[ConditionGroup],
    ) -> bool {
        groups.iter().any(|group| {
            group.conditions.iter().all(|cond| match cond {
                Condition::Exists => current.is_some(),
                Condition::NotExists => current.is_none(),
                Condition::Equal(v) => current == Some(v),
                Condition::NotEqual(v) => current != Some(v),
            })
        })
    }

    fn load_bitmap(
        map: &BTreeMap<Vec<u8>, Entry>,
        key: &[u8],
        now: i64,
    ) -> Result<hiveflow_bitmap::RoaringBitmap> {
        match Self::read_live(map, key, now) {
            Some(data) => Ok(hiveflow_bitmap::parse(&data)?),
            None => Ok(hiveflow_bitmap::RoaringBitmap::new()),
        }
    }

    fn alloc(map: &mut BTreeMap<Vec<u8>, Entry>, key: &[u8], batch: u32) -> IdRange {
        let counter_key = keys::id_counter(key);
        let current = Self::read_live(map, &counter_key, now_unix())
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        let range = IdRange {
            from: current + 1,
            to: current + batch,
        };
        Self::write(map, counter_key, range.to.to_string().into_bytes());
        range
    }

    // --- lifecycle command handlers ---

    fn apply_starting_instance(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        mut instance: hiveflow_meta::WorkflowInstance,
    ) -> Result<CommandResponse> {
        let key = keys::current_instance(instance.workflow_id());
        if let Some(data) = Self::read_live(map, &key, now_unix()) {
            let current: hiveflow_meta::WorkflowInstance = decode("current instance", &data)?;
            if current.instance_id == instance.instance_id {
                // duplicate submission of the same start
                return Ok(CommandResponse::Ok);
            }
            if !current.is_stopped() {
                return Err(StorageError::Precondition(format!(
                    "workflow {} already has instance {} in {:?}",
                    instance.workflow_id(),
                    current.instance_id,
                    current.state
                )));
            }
        }

        instance.state = InstanceState::Starting;
        Self::write(map, key, encode(&instance)?);
        self.emit(StorageEvent::StartingInstance(instance));
        Ok(CommandResponse::Ok)
    }

    fn apply_started_instance(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        workflow_id: u64,
    ) -> Result<CommandResponse> {
        let key = keys::current_instance(workflow_id);
        let data = Self::read_live(map, &key, now_unix())
            .ok_or_else(|| StorageError::NotFound(format!("instance of workflow {workflow_id}")))?;
        let mut instance: hiveflow_meta::WorkflowInstance = decode("current instance", &data)?;

        match instance.state {
            InstanceState::Starting => {
                instance.state = InstanceState::Running;
                instance.started_at = Some(chrono::Utc::now());
                Self::write(map, key, encode(&instance)?);
                self.emit(StorageEvent::RunningInstance(instance));
                Ok(CommandResponse::Ok)
            }
            InstanceState::Running => Ok(CommandResponse::Ok),
            state => Err(StorageError::Precondition(format!(
                "cannot start workflow {workflow_id} from {state:?}"
            ))),
        }
    }

    fn apply_stop_instance(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        workflow_id: u64,
    ) -> Result<CommandResponse> {
        let key = keys::current_instance(workflow_id);
        let data = Self::read_live(map, &key, now_unix())
            .ok_or_else(|| StorageError::NotFound(format!("instance of workflow {workflow_id}")))?;
        let mut instance: hiveflow_meta::WorkflowInstance = decode("current instance", &data)?;

        match instance.state {
            InstanceState::Starting | InstanceState::Running => {
                instance.state = InstanceState::Stopping;
                Self::write(map, key, encode(&instance)?);
                self.emit(StorageEvent::StoppingInstance(instance));
                Ok(CommandResponse::Ok)
            }
            InstanceState::Stopping | InstanceState::Stopped => Ok(CommandResponse::Ok),
        }
    }

    fn apply_stopped_instance(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        workflow_id: u64,
    ) -> Result<CommandResponse> {
        let key = keys::current_instance(workflow_id);
        let data = Self::read_live(map, &key, now_unix())
            .ok_or_else(|| StorageError::NotFound(format!("instance of workflow {workflow_id}")))?;
        let mut instance: hiveflow_meta::WorkflowInstance = decode("current instance", &data)?;

        match instance.state {
            InstanceState::Stopping => {
                instance.state = InstanceState::Stopped;
                instance.stopped_at = Some(chrono::Utc::now());
                let instance_id = instance.instance_id;
                Self::write(map, key, encode(&instance)?);
                self.emit(StorageEvent::StoppedInstance {
                    workflow_id,
                    instance_id,
                });
                Ok(CommandResponse::Ok)
            }
            InstanceState::Stopped => Ok(CommandResponse::Ok),
            state => Err(StorageError::Precondition(format!(
                "cannot stop workflow {workflow_id} from {state:?}"
            ))),
        }
    }

    fn apply_create_shard(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        state: WorkerState,
    ) -> Result<CommandResponse> {
        let key = keys::worker_state(state.workflow_id, state.index);
        if Self::read_live(map, &key, now_unix()).is_some() {
            // retried start; the shard already exists and its worker runs
            return Ok(CommandResponse::Ok);
        }

        Self::write(map, key, encode(&state)?);
        self.emit(StorageEvent::RunningInstanceWorker(state));
        Ok(CommandResponse::Ok)
    }

    fn apply_remove_shard(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        workflow_id: u64,
        index: u32,
    ) -> Result<CommandResponse> {
        let key = keys::worker_state(workflow_id, index);
        let Some(data) = Self::read_live(map, &key, now_unix()) else {
            return Ok(CommandResponse::Ok);
        };

        let state: WorkerState = decode("worker state", &data)?;
        map.remove(&key);
        self.emit(StorageEvent::RemoveInstanceWorker(state));
        Ok(CommandResponse::Ok)
    }

    fn apply_update_shard(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        mut state: WorkerState,
        expect_version: u64,
        crowd_chunks: Vec<(Vec<u8>, Vec<u8>)>,
        notifies: Vec<hiveflow_meta::Notify>,
        offset: Option<crate::command::OffsetCommit>,
    ) -> Result<CommandResponse> {
        let key = keys::worker_state(state.workflow_id, state.index);
        let data = Self::read_live(map, &key, now_unix()).ok_or_else(|| {
            StorageError::NotFound(format!(
                "worker state {}/{}",
                state.workflow_id, state.index
            ))
        })?;
        let stored: WorkerState = decode("worker state", &data)?;
        if stored.version != expect_version {
            return Err(StorageError::Conflict(format!(
                "worker state {}/{} at version {}, expected {}",
                state.workflow_id, state.index, stored.version, expect_version
            )));
        }

        state.version = expect_version + 1;
        let tenant = state.tenant_id;
        let shard_index = state.index;
        Self::write(map, key, encode(&state)?);

        for (chunk_key, chunk_value) in crowd_chunks {
            Self::write(map, chunk_key, chunk_value);
        }

        if !notifies.is_empty() {
            let meta_key = keys::queue_meta(tenant, QueueKind::Output);
            let meta = Self::read_live(map, &meta_key, now_unix()).ok_or_else(|| {
                StorageError::NotFound(format!("output queue meta for tenant {tenant}"))
            })?;
            let meta: QueueState = decode("queue meta", &meta)?;
            let partition = shard_index % meta.partitions.max(1);
            let items = notifies
                .iter()
                .map(encode)
                .collect::<Result<Vec<_>>>()?;
            self.queue_add(map, tenant, QueueKind::Output, partition, items)?;
        }

        if let Some(commit) = offset {
            self.queue_commit(
                map,
                commit.tenant,
                commit.kind,
                commit.partition,
                &commit.group,
                commit.consumer,
                commit.version,
                commit.offset,
            )?;
        }

        Ok(CommandResponse::Ok)
    }

    fn apply_tenant_init(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        input_partitions: u32,
        output_partitions: u32,
    ) -> Result<CommandResponse> {
        let input_meta_key = keys::queue_meta(tenant, QueueKind::Input);
        if Self::read_live(map, &input_meta_key, now_unix()).is_some() {
            return Ok(CommandResponse::Ok);
        }

        let input_meta = QueueState::new(input_partitions, crate::queue::DEFAULT_TIMEOUT_SECS);
        let output_meta = QueueState::new(output_partitions, crate::queue::DEFAULT_TIMEOUT_SECS);
        Self::write(map, input_meta_key, encode(&input_meta)?);
        Self::write(
            map,
            keys::queue_meta(tenant, QueueKind::Output),
            encode(&output_meta)?,
        );

        // internal worker group: identity assignment, eviction disabled
        let mut workers = QueueState::new(input_partitions, 0);
        workers.consumers = input_partitions;
        let now = now_unix();
        for (i, partition) in workers.states.iter_mut().enumerate() {
            partition.consumer = i as u32;
            partition.last_fetch_ts = now;
        }
        Self::write(
            map,
            keys::queue_group_state(tenant, QueueKind::Input, WORKER_GROUP),
            encode(&workers)?,
        );
        for p in 0..input_partitions {
            let pk = keys::partition(tenant, QueueKind::Input, p);
            crate::queue::ensure_commit_record(map, &pk, WORKER_GROUP, now);
        }

        debug!(tenant, input_partitions, output_partitions, "tenant initialized");
        Ok(CommandResponse::Ok)
    }

    fn apply_update_mapping(
        &self,
        map: &mut BTreeMap<Vec<u8>, Entry>,
        tenant: u64,
        user_id: u32,
        update: IdSet,
    ) -> Result<CommandResponse> {
        let key = keys::mapping(tenant, user_id);
        let mut set = match Self::read_live(map, &key, now_unix()) {
            Some(data) => decode("mapping", &data)?,
            None => IdSet::default(),
        };
        set.merge(update);
        Self::write(map, key, encode(&set)?);
        Ok(CommandResponse::IdSet(set))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().expect("storage lock poisoned");
        Ok(Self::read_live(&map, key, now_unix()))
    }

    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut map = self.map.write().expect("storage lock poisoned");
        Self::write(&mut map, key.to_vec(), value);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &[u8], value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let mut map = self.map.write().expect("storage lock poisoned");
        let expires_at = if ttl_secs == 0 {
            0
        } else {
            now_unix() + ttl_secs as i64
        };
        map.insert(key.to_vec(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut map = self.map.write().expect("storage lock poisoned");
        map.remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read().expect("storage lock poisoned");
        let now = now_unix();
        Ok(map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .filter(|(_, e)| e.live(now))
            .take(limit)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn exec_command(&self, cmd: StoreCommand) -> Result<CommandResponse> {
        let mut map = self.map.write().expect("storage lock poisoned");
        let map = &mut *map;
        let now = now_unix();

        match cmd {
            StoreCommand::StartingInstance { instance } => {
                self.apply_starting_instance(map, instance)
            }
            StoreCommand::StartedInstance { workflow_id } => {
                self.apply_started_instance(map, workflow_id)
            }
            StoreCommand::StopInstance { workflow_id } => self.apply_stop_instance(map, workflow_id),
            StoreCommand::StoppedInstance { workflow_id } => {
                self.apply_stopped_instance(map, workflow_id)
            }
            StoreCommand::CreateInstanceStateShard { state } => self.apply_create_shard(map, state),
            StoreCommand::UpdateInstanceStateShard {
                state,
                expect_version,
                crowd_chunks,
                notifies,
                offset,
            } => self.apply_update_shard(map, state, expect_version, crowd_chunks, notifies, offset),
            StoreCommand::RemoveInstanceStateShard { workflow_id, index } => {
                self.apply_remove_shard(map, workflow_id, index)
            }

            StoreCommand::SetIf {
                key,
                value,
                conditions,
            } => {
                let current = Self::read_live(map, &key, now);
                if Self::check_conditions(current.as_ref(), &conditions) {
                    Self::write(map, key, value);
                    Ok(CommandResponse::Bool(true))
                } else {
                    Ok(CommandResponse::Bool(false))
                }
            }
            StoreCommand::DeleteIf { key, conditions } => {
                let current = Self::read_live(map, &key, now);
                if Self::check_conditions(current.as_ref(), &conditions) {
                    map.remove(&key);
                    Ok(CommandResponse::Bool(true))
                } else {
                    Ok(CommandResponse::Bool(false))
                }
            }

            StoreCommand::AllocId { key, batch } => {
                Ok(CommandResponse::IdRange(Self::alloc(map, &key, batch)))
            }
            StoreCommand::ResetId { key, start_with } => {
                Self::write(
                    map,
                    keys::id_counter(&key),
                    start_with.to_string().into_bytes(),
                );
                Ok(CommandResponse::Ok)
            }

            StoreCommand::BmCreate { key, ids } => {
                let bm: hiveflow_bitmap::RoaringBitmap = ids.into_iter().collect();
                Self::write(map, key, hiveflow_bitmap::marshal(&bm));
                Ok(CommandResponse::Ok)
            }
            StoreCommand::BmAdd { key, ids } => {
                let mut bm = Self::load_bitmap(map, &key, now)?;
                bm.extend(ids);
                Self::write(map, key, hiveflow_bitmap::marshal(&bm));
                Ok(CommandResponse::Ok)
            }
            StoreCommand::BmRemove { key, ids } => {
                let mut bm = Self::load_bitmap(map, &key, now)?;
                for id in ids {
                    bm.remove(id);
                }
                Self::write(map, key, hiveflow_bitmap::marshal(&bm));
                Ok(CommandResponse::Ok)
            }
            StoreCommand::BmClear { key } => {
                let bm = hiveflow_bitmap::RoaringBitmap::new();
                Self::write(map, key, hiveflow_bitmap::marshal(&bm));
                Ok(CommandResponse::Ok)
            }
            StoreCommand::BmContains { key, ids } => {
                let bm = Self::load_bitmap(map, &key, now)?;
                Ok(CommandResponse::Bool(
                    ids.iter().all(|id| bm.contains(*id)),
                ))
            }
            StoreCommand::BmCount { key } => {
                let bm = Self::load_bitmap(map, &key, now)?;
                Ok(CommandResponse::Uint64(bm.len()))
            }
            StoreCommand::BmRange { key, start, limit } => {
                let bm = Self::load_bitmap(map, &key, now)?;
                let values: Vec<u32> = bm
                    .iter()
                    .filter(|id| *id >= start)
                    .take(limit as usize)
                    .collect();
                Ok(CommandResponse::Uint32Slice(values))
            }

            StoreCommand::QueueAdd {
                tenant,
                kind,
                partition,
                items,
                kv,
            } => {
                for (key, value) in kv {
                    Self::write(map, key, value);
                }
                let max_offset = self.queue_add(map, tenant, kind, partition, items)?;
                Ok(CommandResponse::Uint64(max_offset))
            }
            StoreCommand::QueueJoinGroup {
                tenant,
                kind,
                group,
            } => {
                let result = self.queue_join(map, tenant, kind, &group)?;
                Ok(CommandResponse::Join(result))
            }
            StoreCommand::QueueFetch {
                tenant,
                kind,
                partition,
                group,
                consumer,
                version,
                count,
                max_bytes,
            } => {
                let result = self.queue_fetch(
                    map, tenant, kind, partition, &group, consumer, version, count, max_bytes,
                )?;
                Ok(CommandResponse::Fetch(result))
            }
            StoreCommand::QueueCommit {
                tenant,
                kind,
                partition,
                group,
                consumer,
                version,
                offset,
            } => {
                self.queue_commit(map, tenant, kind, partition, &group, consumer, version, offset)?;
                Ok(CommandResponse::Ok)
            }

            StoreCommand::TenantInit {
                tenant,
                input_partitions,
                output_partitions,
            } => self.apply_tenant_init(map, tenant, input_partitions, output_partitions),
            StoreCommand::UpdateMapping {
                tenant,
                user_id,
                set,
            } => self.apply_update_mapping(map, tenant, user_id, set),
            StoreCommand::GetMapping { tenant, user_id } => {
                let key = keys::mapping(tenant, user_id);
                let set = match Self::read_live(map, &key, now) {
                    Some(data) => decode("mapping", &data)?,
                    None => IdSet::default(),
                };
                Ok(CommandResponse::IdSet(set))
            }
        }
    }

    fn watch_events(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiveflow_meta::{IdValue, Step, Workflow, WorkflowInstance};

    fn test_instance(workflow_id: u64, instance_id: u64) -> WorkflowInstance {
        WorkflowInstance {
            instance_id,
            snapshot: Workflow::new(workflow_id, 1, "wf").with_step(Step::sink("end")),
            loader: hiveflow_meta::LoaderKind::Raw,
            loader_meta: Vec::new(),
            total_crowd: 0,
            workers: 1,
            state: InstanceState::Starting,
            started_at: None,
            stopped_at: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStorage::new();
        store.set(b"key1", b"value1".to_vec()).await.unwrap();
        assert_eq!(store.get(b"key1").await.unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStorage::new();
        store.set(b"key1", b"value1".to_vec()).await.unwrap();
        store.delete(b"key1").await.unwrap();
        assert_eq!(store.get(b"key1").await.unwrap(), None);
        // deleting again is fine
        store.delete(b"key1").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_with_ttl_zero_means_forever() {
        let store = MemoryStorage::new();
        store.set_with_ttl(b"key1", b"v".to_vec(), 0).await.unwrap();
        assert!(store.get(b"key1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_gone() {
        let store = MemoryStorage::new();
        store.set_with_ttl(b"key1", b"v".to_vec(), 3600).await.unwrap();
        assert!(store.get(b"key1").await.unwrap().is_some());

        // force the entry into the past
        {
            let mut map = store.map.write().unwrap();
            map.get_mut(b"key1".as_slice()).unwrap().expires_at = now_unix() - 1;
        }
        assert!(store.get(b"key1").await.unwrap().is_none());
        assert!(store.scan(b"key1", b"key2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_respects_bounds_and_limit() {
        let store = MemoryStorage::new();
        for i in 1..9 {
            store
                .set(format!("k{i}").as_bytes(), format!("v{i}").into_bytes())
                .await
                .unwrap();
        }

        let all = store.scan(b"k1", b"k9", 9).await.unwrap();
        assert_eq!(all.len(), 8);

        let limited = store.scan(b"k1", b"k9", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].1, b"v1");

        let tail = store.scan(b"k5", b"k9", 10).await.unwrap();
        assert_eq!(tail.len(), 4);
    }

    #[tokio::test]
    async fn test_set_if() {
        let store = MemoryStorage::new();

        // no group passes on a missing key
        let resp = store
            .exec_command(StoreCommand::SetIf {
                key: b"key1".to_vec(),
                value: b"value1".to_vec(),
                conditions: vec![
                    ConditionGroup {
                        conditions: vec![Condition::Exists],
                    },
                    ConditionGroup {
                        conditions: vec![Condition::NotExists, Condition::Equal(b"value1".to_vec())],
                    },
                ],
            })
            .await
            .unwrap();
        assert!(!resp.into_bool());
        assert_eq!(store.get(b"key1").await.unwrap(), None);

        let resp = store
            .exec_command(StoreCommand::SetIf {
                key: b"key1".to_vec(),
                value: b"value2".to_vec(),
                conditions: vec![ConditionGroup {
                    conditions: vec![Condition::NotExists],
                }],
            })
            .await
            .unwrap();
        assert!(resp.into_bool());
        assert_eq!(store.get(b"key1").await.unwrap(), Some(b"value2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_if() {
        let store = MemoryStorage::new();
        store.set(b"key1", b"value1".to_vec()).await.unwrap();

        let resp = store
            .exec_command(StoreCommand::DeleteIf {
                key: b"key1".to_vec(),
                conditions: vec![ConditionGroup {
                    conditions: vec![Condition::Equal(b"value2".to_vec())],
                }],
            })
            .await
            .unwrap();
        assert!(!resp.into_bool());
        assert!(store.get(b"key1").await.unwrap().is_some());

        let resp = store
            .exec_command(StoreCommand::DeleteIf {
                key: b"key1".to_vec(),
                conditions: vec![ConditionGroup {
                    conditions: vec![Condition::Exists],
                }],
            })
            .await
            .unwrap();
        assert!(resp.into_bool());
        assert!(store.get(b"key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alloc_id_and_reset() {
        let store = MemoryStorage::new();

        let range = store.alloc_id(b"key1", 1).await.unwrap();
        assert_eq!((range.from, range.to), (1, 1));

        let range = store.alloc_id(b"key1", 2).await.unwrap();
        assert_eq!((range.from, range.to), (2, 3));

        store
            .exec_command(StoreCommand::ResetId {
                key: b"key1".to_vec(),
                start_with: 0,
            })
            .await
            .unwrap();
        let range = store.alloc_id(b"key1", 2).await.unwrap();
        assert_eq!((range.from, range.to), (1, 2));
    }

    #[tokio::test]
    async fn test_bitmap_commands() {
        let store = MemoryStorage::new();
        let key = b"bm1".to_vec();

        store
            .exec_command(StoreCommand::BmCreate {
                key: key.clone(),
                ids: vec![1, 2, 3, 4, 5],
            })
            .await
            .unwrap();

        let resp = store
            .exec_command(StoreCommand::BmCount { key: key.clone() })
            .await
            .unwrap();
        assert_eq!(resp, CommandResponse::Uint64(5));

        store
            .exec_command(StoreCommand::BmAdd {
                key: key.clone(),
                ids: vec![6, 7],
            })
            .await
            .unwrap();
        store
            .exec_command(StoreCommand::BmRemove {
                key: key.clone(),
                ids: vec![3, 4, 5],
            })
            .await
            .unwrap();

        let resp = store
            .exec_command(StoreCommand::BmContains {
                key: key.clone(),
                ids: vec![1, 2],
            })
            .await
            .unwrap();
        assert!(resp.into_bool());

        let resp = store
            .exec_command(StoreCommand::BmRange {
                key: key.clone(),
                start: 2,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(resp, CommandResponse::Uint32Slice(vec![2, 6]));

        store
            .exec_command(StoreCommand::BmClear { key: key.clone() })
            .await
            .unwrap();
        let resp = store.exec_command(StoreCommand::BmCount { key }).await.unwrap();
        assert_eq!(resp, CommandResponse::Uint64(0));
    }

    #[tokio::test]
    async fn test_update_mapping_merges_by_type() {
        let store = MemoryStorage::new();

        let resp = store
            .exec_command(StoreCommand::UpdateMapping {
                tenant: 1,
                user_id: 7,
                set: IdSet {
                    values: vec![IdValue::new("c0", "id0-v1"), IdValue::new("c1", "id1-v1")],
                },
            })
            .await
            .unwrap();
        let CommandResponse::IdSet(set) = resp else {
            panic!("unexpected response");
        };
        assert_eq!(set.values.len(), 2);

        let resp = store
            .exec_command(StoreCommand::UpdateMapping {
                tenant: 1,
                user_id: 7,
                set: IdSet {
                    values: vec![IdValue::new("c0", "id0-v2"), IdValue::new("c2", "id2-v1")],
                },
            })
            .await
            .unwrap();
        let CommandResponse::IdSet(set) = resp else {
            panic!("unexpected response");
        };
        assert_eq!(set.values.len(), 3);
        assert_eq!(set.get("c0"), Some("id0-v2"));
        assert_eq!(set.get("c1"), Some("id1-v1"));

        let resp = store
            .exec_command(StoreCommand::GetMapping {
                tenant: 1,
                user_id: 7,
            })
            .await
            .unwrap();
        let CommandResponse::IdSet(set) = resp else {
            panic!("unexpected response");
        };
        assert_eq!(set.values.len(), 3);
    }

    #[tokio::test]
    async fn test_instance_lifecycle_events() {
        let store = MemoryStorage::new();
        let mut events = store.watch_events();

        store
            .exec_command(StoreCommand::StartingInstance {
                instance: test_instance(5, 50),
            })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::StartingInstance(i) if i.instance_id == 50
        ));

        // duplicate submission of the same instance is a silent no-op
        store
            .exec_command(StoreCommand::StartingInstance {
                instance: test_instance(5, 50),
            })
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        // a different instance while not stopped is rejected
        let result = store
            .exec_command(StoreCommand::StartingInstance {
                instance: test_instance(5, 51),
            })
            .await;
        assert!(matches!(result, Err(StorageError::Precondition(_))));

        store
            .exec_command(StoreCommand::StartedInstance { workflow_id: 5 })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::RunningInstance(i) if i.started_at.is_some()
        ));

        store
            .exec_command(StoreCommand::StopInstance { workflow_id: 5 })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::StoppingInstance(_)
        ));

        store
            .exec_command(StoreCommand::StoppedInstance { workflow_id: 5 })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::StoppedInstance {
                workflow_id: 5,
                instance_id: 50
            }
        ));

        // once stopped, a fresh instance may start
        store
            .exec_command(StoreCommand::StartingInstance {
                instance: test_instance(5, 51),
            })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::StartingInstance(i) if i.instance_id == 51
        ));
    }

    #[tokio::test]
    async fn test_shard_create_remove_events() {
        let store = MemoryStorage::new();
        let mut events = store.watch_events();

        let state = WorkerState {
            tenant_id: 1,
            workflow_id: 5,
            instance_id: 50,
            index: 0,
            start: 1,
            end: 100,
            stop_at: 0,
            version: 0,
            states: vec![],
        };

        store
            .exec_command(StoreCommand::CreateInstanceStateShard {
                state: state.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::RunningInstanceWorker(_)
        ));

        // creating the same shard again emits nothing
        store
            .exec_command(StoreCommand::CreateInstanceStateShard { state })
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        store
            .exec_command(StoreCommand::RemoveInstanceStateShard {
                workflow_id: 5,
                index: 0,
            })
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StorageEvent::RemoveInstanceWorker(s) if s.instance_id == 50
        ));

        // removing an absent shard is a no-op
        store
            .exec_command(StoreCommand::RemoveInstanceStateShard {
                workflow_id: 5,
                index: 0,
            })
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_shard_version_fencing() {
        let store = MemoryStorage::new();
        let state = WorkerState {
            tenant_id: 1,
            workflow_id: 5,
            instance_id: 50,
            index: 0,
            start: 1,
            end: 100,
            stop_at: 0,
            version: 0,
            states: vec![],
        };
        store
            .exec_command(StoreCommand::CreateInstanceStateShard {
                state: state.clone(),
            })
            .await
            .unwrap();

        store
            .exec_command(StoreCommand::UpdateInstanceStateShard {
                state: state.clone(),
                expect_version: 0,
                crowd_chunks: vec![],
                notifies: vec![],
                offset: None,
            })
            .await
            .unwrap();

        // the stored version moved to 1; a stale writer is rejected
        let result = store
            .exec_command(StoreCommand::UpdateInstanceStateShard {
                state,
                expect_version: 0,
                crowd_chunks: vec![],
                notifies: vec![],
                offset: None,
            })
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }
}
