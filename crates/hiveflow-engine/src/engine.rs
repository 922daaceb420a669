//! The engine controller
//!
//! One event-loop task owns instance lifecycle: it submits storage
//! commands, and reacts to the storage event stream when they apply — the
//! stream, not the submission, is the source of truth for transitions, so
//! any node observes the same sequence. Failed lifecycle steps are
//! rescheduled onto bounded retry channels after `retry_interval`; every
//! retried command is a state-transition verb that no-ops once the target
//! state is reached, which is what makes the retries safe.

use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::options::EngineOptions;
use crate::shard::{route, shard_ranges, RangeCache};
use crate::worker::StateWorker;
use hiveflow_bitmap::{split_by_cardinality, BitmapPool, RoaringBitmap};
use hiveflow_crowd::new_loader;
use hiveflow_meta::{
    CountState, Event, InstanceCountState, InstanceSnapshot, InstanceState, LoaderKind, QueueKind,
    QueueState, StepCrowd, StepCrowdRef, StepState, UserEvent, Workflow, WorkflowInstance,
    WorkerState,
};
use hiveflow_storage::{decode, encode, keys, Storage, StorageError, StorageEvent, StoreCommand};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A running worker registered on this node
struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Receivers owned by the event loop
struct LoopChannels {
    events: broadcast::Receiver<StorageEvent>,
    retry_new_rx: mpsc::Receiver<WorkflowInstance>,
    retry_stopping_rx: mpsc::Receiver<WorkflowInstance>,
    retry_complete_rx: mpsc::Receiver<u64>,
    stop_rx: mpsc::Receiver<u64>,
    shutdown_rx: watch::Receiver<bool>,
}

/// The crowd-scale workflow engine
///
/// Registries (worker map, range cache, bitmap pool) are fields, never
/// process globals, so several engines can coexist in one test binary.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown_tx: watch::Sender<bool>,
    channels: Mutex<Option<LoopChannels>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineInner {
    store: Arc<dyn Storage>,
    opts: EngineOptions,
    pool: Arc<BitmapPool>,
    metrics: Arc<EngineMetrics>,

    workers: RwLock<HashMap<String, WorkerHandle>>,
    ranges: RangeCache,

    retry_new_tx: mpsc::Sender<WorkflowInstance>,
    retry_stopping_tx: mpsc::Sender<WorkflowInstance>,
    retry_complete_tx: mpsc::Sender<u64>,
    stop_tx: mpsc::Sender<u64>,

    shutdown_rx: watch::Receiver<bool>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Engine {
    /// Create an engine over a storage backend
    pub fn new(store: Arc<dyn Storage>, opts: EngineOptions) -> Self {
        let (retry_new_tx, retry_new_rx) = mpsc::channel(16);
        let (retry_stopping_tx, retry_stopping_rx) = mpsc::channel(16);
        let (retry_complete_tx, retry_complete_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // subscribe before anything can emit so no event is missed
        let events = store.watch_events();

        let inner = Arc::new(EngineInner {
            store,
            opts,
            pool: Arc::new(BitmapPool::new()),
            metrics: Arc::new(EngineMetrics::new()),
            workers: RwLock::new(HashMap::new()),
            ranges: RangeCache::new(),
            retry_new_tx,
            retry_stopping_tx,
            retry_complete_tx,
            stop_tx,
            shutdown_rx: shutdown_rx.clone(),
        });

        Self {
            inner,
            shutdown_tx,
            channels: Mutex::new(Some(LoopChannels {
                events,
                retry_new_rx,
                retry_stopping_rx,
                retry_complete_rx,
                stop_rx,
                shutdown_rx,
            })),
            loop_handle: Mutex::new(None),
        }
    }

    /// Start the controller event loop
    pub fn start(&self) -> Result<()> {
        let channels = self
            .channels
            .lock()
            .expect("engine lock poisoned")
            .take()
            .ok_or_else(|| EngineError::Precondition("engine already started".to_string()))?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_loop(inner, channels));
        *self.loop_handle.lock().expect("engine lock poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the controller and every worker on this node
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut workers = self.inner.workers.write().expect("worker registry poisoned");
        for (key, handle) in workers.drain() {
            debug!(worker = %key, "stopping worker");
            let _ = handle.stop_tx.send(true);
            handle.join.abort();
        }
    }

    /// Engine counters
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.inner.metrics.clone()
    }

    /// Provision a tenant's queues
    pub async fn tenant_init(
        &self,
        tenant: u64,
        input_partitions: u32,
        output_partitions: u32,
    ) -> Result<()> {
        self.inner
            .store
            .exec_command(StoreCommand::TenantInit {
                tenant,
                input_partitions,
                output_partitions,
            })
            .await?;
        Ok(())
    }

    /// Persist a workflow definition under a fresh ID
    pub async fn create_workflow(&self, mut workflow: Workflow) -> Result<u64> {
        workflow.validate()?;
        let id = self.inner.store.alloc_id(b"workflow", 1).await?.from as u64;
        workflow.id = id;
        self.inner
            .store
            .set(&keys::workflow(id), encode(&workflow)?)
            .await?;
        Ok(id)
    }

    /// Start a new instance of `workflow` over the crowd `loader_meta`
    /// resolves to, split across `workers` shards
    ///
    /// If the workflow's previous instance is stopped, its crowd is
    /// subtracted so re-started workflows never re-enter users already
    /// processed. Fails unless the previous instance (if any) is stopped.
    pub async fn start_instance(
        &self,
        workflow: Workflow,
        loader: LoaderKind,
        loader_meta: Vec<u8>,
        workers: u32,
    ) -> Result<u64> {
        workflow.validate()?;
        let inner = &self.inner;
        let workflow_id = workflow.id;
        let tenant = workflow.tenant_id;

        let queue_meta = inner
            .store
            .get(&keys::queue_meta(tenant, QueueKind::Input))
            .await?
            .ok_or_else(|| {
                EngineError::Precondition(format!("tenant {tenant} not initialized"))
            })?;
        let queue_meta: QueueState = decode("queue meta", &queue_meta)?;
        if workers == 0 || workers > queue_meta.partitions {
            return Err(EngineError::Precondition(format!(
                "workers must be in [1, {}]",
                queue_meta.partitions
            )));
        }

        let previous = match inner
            .store
            .get(&keys::current_instance(workflow_id))
            .await?
        {
            Some(data) => {
                let current: WorkflowInstance = decode("current instance", &data)?;
                if !current.is_stopped() {
                    return Err(EngineError::Precondition(format!(
                        "workflow {workflow_id} instance {} is {:?}",
                        current.instance_id, current.state
                    )));
                }
                Some(current)
            }
            None => None,
        };

        let mut crowd = new_loader(loader, inner.store.clone())
            .get(&loader_meta)
            .await?;
        if let Some(previous) = previous {
            let prev_crowd = new_loader(previous.loader, inner.store.clone())
                .get(&previous.loader_meta)
                .await?;
            crowd -= prev_crowd;
        }

        let instance_id = inner.store.alloc_id(b"instance", 1).await?.from as u64;

        // the effective crowd persists under a stable prefix; it stays
        // behind after stop as the subtraction base for the next start
        let prefix = format!(
            "{}total-",
            String::from_utf8_lossy(&keys::crowd_prefix(workflow_id, instance_id))
        );
        let sharded = new_loader(LoaderKind::ShardedKv, inner.store.clone());
        let instance_meta = sharded.set(&prefix, &crowd).await?;

        let instance = WorkflowInstance {
            instance_id,
            snapshot: workflow,
            loader: LoaderKind::ShardedKv,
            loader_meta: instance_meta,
            total_crowd: crowd.len(),
            workers,
            state: InstanceState::Starting,
            started_at: None,
            stopped_at: None,
        };

        inner
            .store
            .exec_command(StoreCommand::StartingInstance { instance })
            .await?;
        Ok(instance_id)
    }

    /// Request teardown of the workflow's current instance; a no-op when
    /// none exists
    pub async fn stop_instance(&self, workflow_id: u64) -> Result<()> {
        let inner = &self.inner;
        if inner
            .store
            .get(&keys::current_instance(workflow_id))
            .await?
            .is_none()
        {
            return Ok(());
        }

        inner
            .store
            .exec_command(StoreCommand::StopInstance { workflow_id })
            .await?;
        Ok(())
    }

    /// Rewrite the running instance's workflow snapshot
    ///
    /// The change travels as an in-band event on every input partition so
    /// each shard worker adopts it in queue order with user events.
    pub async fn update_workflow(&self, workflow: Workflow) -> Result<()> {
        workflow.validate()?;
        let inner = &self.inner;

        let key = keys::current_instance(workflow.id);
        let data = inner.store.get(&key).await?.ok_or_else(|| {
            EngineError::NotFound(format!("workflow {} has no instance", workflow.id))
        })?;
        let mut current: WorkflowInstance = decode("current instance", &data)?;
        if !matches!(
            current.state,
            InstanceState::Starting | InstanceState::Running
        ) {
            return Err(EngineError::Precondition(format!(
                "instance {} is {:?}",
                current.instance_id, current.state
            )));
        }

        current.snapshot = workflow.clone();
        inner.store.set(&key, encode(&current)?).await?;

        let item = encode(&Event::UpdateWorkflow { workflow })?;
        for partition in 0..current.workers {
            inner
                .store
                .put_to_queue(
                    current.tenant_id(),
                    QueueKind::Input,
                    partition,
                    vec![item.clone()],
                )
                .await?;
        }
        Ok(())
    }

    /// Replace the instance's total crowd
    ///
    /// The delta is allocated per shard so existing boundaries stay put:
    /// users inside a shard's range go to that shard; users beyond every
    /// range land on the last shard, whose routing range is extended.
    pub async fn update_crowd(
        &self,
        workflow_id: u64,
        loader: LoaderKind,
        loader_meta: Vec<u8>,
    ) -> Result<()> {
        let inner = &self.inner;
        let current = inner.current_running_instance(workflow_id).await?;
        let new_total = new_loader(loader, inner.store.clone())
            .get(&loader_meta)
            .await?;

        let states = inner.shard_states(&current).await?;
        let last = states.len() - 1;
        let mut covered = RoaringBitmap::new();
        let mut assigned: Vec<RoaringBitmap> = Vec::with_capacity(states.len());
        for state in &states {
            let mut shard_new = new_total.clone();
            if state.end > state.start {
                shard_new.remove_range(0..state.start);
                shard_new.remove_range(state.end..=u32::MAX);
            } else {
                shard_new.clear();
            }
            covered |= &shard_new;
            assigned.push(shard_new);
        }

        let leftover = hiveflow_bitmap::and_not(&new_total, &covered);
        if !leftover.is_empty() {
            if let Some(max) = leftover.max() {
                inner.ranges.extend_last(current.instance_id, max + 1);
            }
            assigned[last] |= leftover;
        }

        for (state, shard_new) in states.iter().zip(&assigned) {
            let item = encode(&Event::UpdateCrowd {
                index: state.index,
                crowd: hiveflow_bitmap::marshal(shard_new),
            })?;
            inner
                .store
                .put_to_queue(
                    current.tenant_id(),
                    QueueKind::Input,
                    state.index,
                    vec![item],
                )
                .await?;
        }
        Ok(())
    }

    /// Per-step cardinalities aggregated across all shards
    ///
    /// Fails if any shard's state cannot be read — never partial data.
    pub async fn instance_count_state(&self, workflow_id: u64) -> Result<InstanceCountState> {
        let inner = &self.inner;
        let current = inner.current_running_instance(workflow_id).await?;
        let states = inner.shard_states(&current).await?;

        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;
        for shard in &states {
            for step_state in &shard.states {
                let name = &step_state.step.name;
                if !counts.contains_key(name) {
                    order.push(name.clone());
                }
                *counts.entry(name.clone()).or_insert(0) += step_state.total_crowd;
                total += step_state.total_crowd;
            }
        }

        Ok(InstanceCountState {
            total,
            states: order
                .into_iter()
                .map(|step| {
                    let count = counts[&step];
                    CountState { step, count }
                })
                .collect(),
        })
    }

    /// One step's aggregated crowd, returned as a TTL'd loader reference
    /// instead of an inline payload
    pub async fn instance_step_state(
        &self,
        workflow_id: u64,
        step_name: &str,
    ) -> Result<StepCrowdRef> {
        let inner = &self.inner;
        let current = inner.current_running_instance(workflow_id).await?;
        let states = inner.shard_states(&current).await?;

        let mut found = false;
        let mut union = RoaringBitmap::new();
        for shard in &states {
            for step_state in &shard.states {
                if step_state.step.name == step_name {
                    found = true;
                    union |= inner.load_step_crowd(step_state).await?;
                }
            }
        }
        if !found {
            return Err(EngineError::NotFound(format!("step '{step_name}'")));
        }

        let temp_key = keys::temp(&Uuid::new_v4().to_string());
        inner
            .store
            .set_with_ttl(
                &temp_key,
                hiveflow_bitmap::marshal(&union),
                inner.opts.temp_ttl_secs,
            )
            .await?;

        Ok(StepCrowdRef {
            step: step_name.to_string(),
            loader: LoaderKind::Kv,
            loader_meta: temp_key,
            total_crowd: union.len(),
        })
    }

    /// Look up a stopped instance's snapshot; `None` when missing or
    /// expired
    pub async fn history_instance(
        &self,
        workflow_id: u64,
        instance_id: u64,
    ) -> Result<Option<InstanceSnapshot>> {
        match self
            .inner
            .store
            .get(&keys::history(workflow_id, instance_id))
            .await?
        {
            Some(data) => Ok(Some(decode("history snapshot", &data)?)),
            None => Ok(None),
        }
    }

    /// Deliver a user event to the shard whose range covers the user
    ///
    /// Routing uses the cached shard ranges; events for stopped instances
    /// are dropped.
    pub async fn submit_event(&self, event: UserEvent) -> Result<()> {
        let inner = &self.inner;
        let ranges = match inner.ranges.get(event.instance_id) {
            Some(ranges) => ranges,
            None => inner.load_instance_ranges(&event).await?,
        };

        if ranges.is_empty() {
            // instance stopped
            return Ok(());
        }

        let Some(shard) = route(&ranges, event.user_id) else {
            return Err(EngineError::NotFound(format!(
                "no shard covers user {} of instance {}",
                event.user_id, event.instance_id
            )));
        };

        let tenant = event.tenant_id;
        let item = encode(&Event::User(event))?;
        inner
            .store
            .put_to_queue(tenant, QueueKind::Input, shard, vec![item])
            .await?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.lock().expect("engine lock poisoned").take() {
            handle.abort();
        }
    }
}

/// The controller event loop: one task multiplexing the storage stream and
/// the retry channels
async fn run_loop(inner: Arc<EngineInner>, mut ch: LoopChannels) {
    info!("engine event loop started");
    loop {
        tokio::select! {
            _ = ch.shutdown_rx.changed() => {
                info!("engine event loop stopped");
                return;
            }
            event = ch.events.recv() => match event {
                Ok(event) => inner.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "storage event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("storage event stream closed");
                    return;
                }
            },
            Some(instance) = ch.retry_new_rx.recv() => {
                inner.do_start_instance_event(instance).await;
            }
            Some(instance) = ch.retry_stopping_rx.recv() => {
                inner.do_stopping_instance_event(instance).await;
            }
            Some(workflow_id) = ch.retry_complete_rx.recv() => {
                inner.do_instance_shards_complete(workflow_id).await;
            }
            Some(workflow_id) = ch.stop_rx.recv() => {
                inner.do_stop_instance(workflow_id).await;
            }
        }
    }
}

impl EngineInner {
    async fn handle_event(&self, event: StorageEvent) {
        match event {
            StorageEvent::StartingInstance(instance) => {
                self.do_start_instance_event(instance).await
            }
            StorageEvent::RunningInstance(instance) => {
                self.do_running_instance_event(instance).await
            }
            StorageEvent::StoppingInstance(instance) => {
                self.do_stopping_instance_event(instance).await
            }
            StorageEvent::StoppedInstance {
                workflow_id: _,
                instance_id,
            } => self.do_stopped_instance_event(instance_id).await,
            StorageEvent::RunningInstanceWorker(state) => self.do_start_worker_event(state).await,
            StorageEvent::RemoveInstanceWorker(state) => self.do_remove_worker_event(state).await,
        }
    }

    /// Split the crowd and create one state shard per worker, then mark
    /// the instance started. Any failure reschedules the whole event; the
    /// per-shard create is a no-op for shards that already exist.
    async fn do_start_instance_event(&self, instance: WorkflowInstance) {
        let crowd = match new_loader(instance.loader, self.store.clone())
            .get(&instance.loader_meta)
            .await
        {
            Ok(crowd) => crowd,
            Err(e) => {
                error!(instance = instance.instance_id, error = %e, "instance crowd load failed, retrying");
                self.schedule_retry_new(instance);
                return;
            }
        };

        let shards = split_by_cardinality(&crowd, instance.workers);
        self.ranges
            .put(instance.instance_id, shard_ranges(&shards));

        let stop_at = if instance.snapshot.duration_secs > 0 {
            now_unix() + instance.snapshot.duration_secs as i64
        } else {
            0
        };

        for (index, shard) in shards.iter().enumerate() {
            let (start, end) = match (shard.min(), shard.max()) {
                (Some(min), Some(max)) => (min, max + 1),
                _ => (0, 0),
            };

            let states: Vec<StepState> = instance
                .snapshot
                .steps
                .iter()
                .enumerate()
                .map(|(step_idx, step)| StepState {
                    step: step.clone(),
                    loader: LoaderKind::Raw,
                    loader_meta: if step_idx == 0 {
                        hiveflow_bitmap::marshal(shard)
                    } else {
                        Vec::new()
                    },
                    total_crowd: if step_idx == 0 { shard.len() } else { 0 },
                })
                .collect();

            let state = WorkerState {
                tenant_id: instance.tenant_id(),
                workflow_id: instance.workflow_id(),
                instance_id: instance.instance_id,
                index: index as u32,
                start,
                end,
                stop_at,
                version: 0,
                states,
            };

            if let Err(e) = self
                .store
                .exec_command(StoreCommand::CreateInstanceStateShard { state })
                .await
            {
                error!(
                    instance = instance.instance_id,
                    shard = index,
                    error = %e,
                    "state shard create failed, retrying"
                );
                self.schedule_retry_new(instance);
                return;
            }
        }

        self.do_instance_shards_complete(instance.workflow_id()).await;
    }

    async fn do_instance_shards_complete(&self, workflow_id: u64) {
        if let Err(e) = self
            .store
            .exec_command(StoreCommand::StartedInstance { workflow_id })
            .await
        {
            error!(workflow = workflow_id, error = %e, "instance start completion failed, retrying");
            self.metrics.inc_lifecycle_retries();
            let tx = self.retry_complete_tx.clone();
            let interval = self.opts.retry_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let _ = tx.send(workflow_id).await;
            });
            return;
        }

        info!(workflow = workflow_id, "workflow instance started");
    }

    /// A bounded duration schedules the instance stop
    async fn do_running_instance_event(&self, instance: WorkflowInstance) {
        if instance.snapshot.duration_secs == 0 {
            return;
        }

        let started = instance
            .started_at
            .map(|t| t.timestamp())
            .unwrap_or_else(now_unix);
        let after = started + instance.snapshot.duration_secs as i64 - now_unix();
        let tx = self.stop_tx.clone();
        let workflow_id = instance.workflow_id();

        if after <= 0 {
            let _ = tx.send(workflow_id).await;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(after as u64)).await;
                let _ = tx.send(workflow_id).await;
            });
        }
    }

    async fn do_stop_instance(&self, workflow_id: u64) {
        match self
            .store
            .exec_command(StoreCommand::StopInstance { workflow_id })
            .await
        {
            Ok(_) => info!(workflow = workflow_id, "workflow instance stopping"),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                error!(workflow = workflow_id, error = %e, "instance stop failed, retrying");
                self.metrics.inc_lifecycle_retries();
                let tx = self.stop_tx.clone();
                let interval = self.opts.retry_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    let _ = tx.send(workflow_id).await;
                });
            }
        }
    }

    /// Snapshot history, tear down the shards, then commit `Stopped`
    ///
    /// Every step is idempotent: the history write is skipped when the key
    /// exists, shard removal no-ops on absent shards, and the final verb
    /// no-ops once stopped.
    async fn do_stopping_instance_event(&self, instance: WorkflowInstance) {
        let workflow_id = instance.workflow_id();
        let instance_id = instance.instance_id;

        let result: Result<()> = async {
            let history_key = keys::history(workflow_id, instance_id);
            if self.store.get(&history_key).await?.is_none() {
                let snapshot = self.build_snapshot(&instance).await?;
                self.store
                    .set_with_ttl(&history_key, encode(&snapshot)?, self.opts.history_ttl_secs)
                    .await?;
            }

            for index in 0..instance.workers {
                self.store
                    .exec_command(StoreCommand::RemoveInstanceStateShard { workflow_id, index })
                    .await?;
            }

            self.collect_crowd_chunks(workflow_id, instance_id).await?;

            self.store
                .exec_command(StoreCommand::StoppedInstance { workflow_id })
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(instance = instance_id, error = %e, "instance teardown failed, retrying");
            self.metrics.inc_lifecycle_retries();
            let tx = self.retry_stopping_tx.clone();
            let interval = self.opts.retry_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let _ = tx.send(instance).await;
            });
        } else {
            info!(workflow = workflow_id, instance = instance_id, "workflow instance stopped");
        }
    }

    /// Union the per-step crowds across all remaining shards
    async fn build_snapshot(&self, instance: &WorkflowInstance) -> Result<InstanceSnapshot> {
        let (start, end) = keys::worker_state_range(instance.workflow_id());
        let entries = self.store.scan(&start, &end, usize::MAX).await?;

        let mut order: Vec<String> = Vec::new();
        let mut unions: HashMap<String, RoaringBitmap> = HashMap::new();
        for (_, data) in entries {
            let shard: WorkerState = decode("worker state", &data)?;
            if shard.instance_id != instance.instance_id {
                continue;
            }
            for step_state in &shard.states {
                let crowd = self.load_step_crowd(step_state).await?;
                let name = step_state.step.name.clone();
                if !unions.contains_key(&name) {
                    order.push(name.clone());
                }
                *unions.entry(name).or_default() |= crowd;
            }
        }

        let mut stopped = instance.clone();
        stopped.state = InstanceState::Stopped;

        Ok(InstanceSnapshot {
            instance: stopped,
            timestamp: chrono::Utc::now(),
            states: order
                .into_iter()
                .map(|name| {
                    let crowd = &unions[&name];
                    StepCrowd {
                        name: name.clone(),
                        crowd: hiveflow_bitmap::marshal(crowd),
                        total_crowd: crowd.len(),
                    }
                })
                .collect(),
        })
    }

    /// Delete the per-step crowd chunks of a stopped instance
    ///
    /// The instance's own `total-` bitmap survives: it is the subtraction
    /// base for the workflow's next start.
    async fn collect_crowd_chunks(&self, workflow_id: u64, instance_id: u64) -> Result<()> {
        let prefix = keys::crowd_prefix(workflow_id, instance_id);
        let mut end = prefix.clone();
        if let Some(last) = end.last_mut() {
            *last += 1;
        }

        let total_prefix = format!("{}total-", String::from_utf8_lossy(&prefix)).into_bytes();
        let entries = self.store.scan(&prefix, &end, usize::MAX).await?;
        for (key, _) in entries {
            if key.starts_with(&total_prefix) {
                continue;
            }
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn do_stopped_instance_event(&self, instance_id: u64) {
        self.ranges.mark_stopped(instance_id);

        let prefix = format!("{instance_id}/");
        let removed: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.write().expect("worker registry poisoned");
            let stale: Vec<String> = workers
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|k| workers.remove_entry(&k))
                .collect()
        };

        for (key, handle) in removed {
            debug!(worker = %key, "stopping worker of stopped instance");
            let _ = handle.stop_tx.send(true);
        }
    }

    /// A shard was placed on this node: build and run its worker
    async fn do_start_worker_event(&self, state: WorkerState) {
        let key = state.worker_key();
        if self
            .workers
            .read()
            .expect("worker registry poisoned")
            .contains_key(&key)
        {
            panic!("BUG: worker {key} already exists");
        }

        let now = now_unix();
        if state.stop_at != 0 && now >= state.stop_at {
            debug!(worker = %key, "shard already past its deadline");
            return;
        }
        let stop_at = state.stop_at;
        let workflow_id = state.workflow_id;
        let index = state.index;

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = match StateWorker::build(
            self.store.clone(),
            self.pool.clone(),
            self.opts.clone(),
            self.metrics.clone(),
            state,
            stop_rx,
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                error!(worker = %key, error = %e, "worker build failed");
                return;
            }
        };

        let join = tokio::spawn(worker.run());
        self.workers
            .write()
            .expect("worker registry poisoned")
            .insert(key, WorkerHandle { stop_tx, join });

        if stop_at != 0 {
            self.schedule_shard_deadline(workflow_id, index, stop_at);
        }
    }

    /// When the deadline fires the shard's state is deleted; the resulting
    /// removal event stops the worker
    fn schedule_shard_deadline(&self, workflow_id: u64, index: u32, stop_at: i64) {
        let store = self.store.clone();
        let interval = self.opts.retry_interval;
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let wait = (stop_at - now_unix()).max(0) as u64;
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(wait)) => {}
            }

            loop {
                match store
                    .exec_command(StoreCommand::RemoveInstanceStateShard { workflow_id, index })
                    .await
                {
                    Ok(_) => return,
                    Err(e) => {
                        warn!(workflow = workflow_id, shard = index, error = %e, "deadline removal failed, retrying");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                }
            }
        });
    }

    async fn do_remove_worker_event(&self, state: WorkerState) {
        let key = state.worker_key();
        let handle = self
            .workers
            .write()
            .expect("worker registry poisoned")
            .remove(&key);
        if let Some(handle) = handle {
            debug!(worker = %key, "worker removed");
            let _ = handle.stop_tx.send(true);
        }
    }

    fn schedule_retry_new(&self, instance: WorkflowInstance) {
        self.metrics.inc_lifecycle_retries();
        let tx = self.retry_new_tx.clone();
        let interval = self.opts.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(instance).await;
        });
    }

    /// The workflow's current instance, which must not be stopped
    async fn current_running_instance(&self, workflow_id: u64) -> Result<WorkflowInstance> {
        let data = self
            .store
            .get(&keys::current_instance(workflow_id))
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("workflow {workflow_id} has no instance"))
            })?;
        let current: WorkflowInstance = decode("current instance", &data)?;
        if current.is_stopped() {
            return Err(EngineError::NotFound(format!(
                "workflow {workflow_id} instance {} is stopped",
                current.instance_id
            )));
        }
        Ok(current)
    }

    /// All worker shards of the instance, in index order; errors if any
    /// shard is missing
    async fn shard_states(&self, instance: &WorkflowInstance) -> Result<Vec<WorkerState>> {
        let (start, end) = keys::worker_state_range(instance.workflow_id());
        let entries = self.store.scan(&start, &end, usize::MAX).await?;

        let mut states: Vec<WorkerState> = Vec::with_capacity(entries.len());
        for (_, data) in entries {
            let state: WorkerState = decode("worker state", &data)?;
            if state.instance_id == instance.instance_id {
                states.push(state);
            }
        }
        states.sort_by_key(|s| s.index);

        if states.len() != instance.workers as usize {
            return Err(EngineError::NotFound(format!(
                "instance {} has {}/{} state shards",
                instance.instance_id,
                states.len(),
                instance.workers
            )));
        }
        Ok(states)
    }

    async fn load_step_crowd(&self, step_state: &StepState) -> Result<RoaringBitmap> {
        Ok(new_loader(step_state.loader, self.store.clone())
            .get(&step_state.loader_meta)
            .await?)
    }

    /// Resolve routing ranges for an instance not yet cached
    async fn load_instance_ranges(
        &self,
        event: &UserEvent,
    ) -> Result<crate::shard::ShardRanges> {
        let data = self
            .store
            .get(&keys::current_instance(event.workflow_id))
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("workflow {} has no instance", event.workflow_id))
            })?;
        let current: WorkflowInstance = decode("current instance", &data)?;

        if current.instance_id != event.instance_id || current.is_stopped() {
            // addressed to a finished incarnation
            return Ok(self.ranges.put(event.instance_id, Vec::new()));
        }

        let crowd = new_loader(current.loader, self.store.clone())
            .get(&current.loader_meta)
            .await?;
        let shards = split_by_cardinality(&crowd, current.workers);
        Ok(self
            .ranges
            .put(current.instance_id, shard_ranges(&shards)))
    }
}
