//! The state worker: single-writer loop for one crowd shard
//!
//! Exactly one worker exists per `(instance, index)` on a node. It is the
//! only writer of its `WorkerState`, which is what lets a tick mutate the
//! per-step crowds without locks. Each tick drains due timers, fetches a
//! batch from the shard's input partition, runs a transaction over the
//! batch, and commits the resulting state, output notifications, and queue
//! offset in one atomic storage command. If the commit never happens the
//! offset does not advance, so a restarted worker replays the same events
//! against the same persisted state and produces the same transitions.

use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::options::EngineOptions;
use crate::step::{compile_steps, CompiledExecution, CompiledStep};
use crate::transaction::{Change, TickOutcome, Transaction};
use hiveflow_bitmap::{BitmapPool, RoaringBitmap};
use hiveflow_crowd::{new_loader, ShardedMeta};
use hiveflow_meta::{
    Event, LoaderKind, Notify, QueueKind, Step, StepState, Workflow, WorkerState,
};
use hiveflow_storage::{
    keys, CommandResponse, OffsetCommit, QueueFetchResult, Storage, StorageError, StoreCommand,
    WORKER_GROUP,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Next-fire bookkeeping for one timer step
#[derive(Debug, Clone)]
struct TimerSlot {
    interval_secs: u64,
    next_fire: i64,
}

pub(crate) struct StateWorker {
    key: String,
    store: Arc<dyn Storage>,
    pool: Arc<BitmapPool>,
    opts: EngineOptions,
    metrics: Arc<EngineMetrics>,

    state: WorkerState,
    steps: Vec<CompiledStep>,
    total_crowds: RoaringBitmap,
    step_crowds: Vec<RoaringBitmap>,
    timers: Vec<Option<TimerSlot>>,

    stop_rx: watch::Receiver<bool>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl StateWorker {
    /// Load the shard's crowds and compile its steps
    pub async fn build(
        store: Arc<dyn Storage>,
        pool: Arc<BitmapPool>,
        opts: EngineOptions,
        metrics: Arc<EngineMetrics>,
        state: WorkerState,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let workflow = Workflow {
            id: state.workflow_id,
            tenant_id: state.tenant_id,
            name: String::new(),
            duration_secs: 0,
            steps: state.states.iter().map(|s| s.step.clone()).collect(),
        };
        let steps = compile_steps(&workflow)?;

        let mut step_crowds = Vec::with_capacity(state.states.len());
        let mut total = pool.acquire();
        for step_state in &state.states {
            let loader = new_loader(step_state.loader, store.clone());
            let crowd = loader.get(&step_state.loader_meta).await?;
            total |= &crowd;
            step_crowds.push(crowd);
        }

        let timers = Self::build_timers(&store, &state, &steps).await;

        Ok(Self {
            key: state.worker_key(),
            store,
            pool,
            opts,
            metrics,
            state,
            steps,
            total_crowds: total,
            step_crowds,
            timers,
            stop_rx,
        })
    }

    async fn build_timers(
        store: &Arc<dyn Storage>,
        state: &WorkerState,
        steps: &[CompiledStep],
    ) -> Vec<Option<TimerSlot>> {
        let mut timers = Vec::with_capacity(steps.len());
        for compiled in steps {
            let CompiledExecution::Timer { interval_secs, .. } = &compiled.execution else {
                timers.push(None);
                continue;
            };

            let key = keys::step_last_trigger(
                state.workflow_id,
                state.instance_id,
                &compiled.step.name,
            );
            let last = match store.get(&key).await {
                Ok(Some(data)) => String::from_utf8(data).ok().and_then(|s| s.parse().ok()),
                _ => None,
            };
            let base = last.unwrap_or_else(now_unix);
            timers.push(Some(TimerSlot {
                interval_secs: *interval_secs,
                next_fire: base + *interval_secs as i64,
            }));
        }
        timers
    }

    /// The worker loop; runs until stopped or past the shard deadline
    pub async fn run(mut self) {
        info!(worker = %self.key, "state worker started");

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            if self.state.stop_at != 0 && now_unix() >= self.state.stop_at {
                info!(worker = %self.key, "shard deadline reached");
                break;
            }

            let due_timers = self.due_timers();

            let fetched = match self.fetch().await {
                Ok(result) => result,
                Err(e) => {
                    warn!(worker = %self.key, error = %e, "queue fetch failed");
                    self.sleep(self.opts.retry_interval).await;
                    continue;
                }
            };
            if fetched.removed {
                // identity assignment never revokes; this means the tenant
                // queue was re-provisioned underneath us
                error!(worker = %self.key, "fetch fenced out, backing off");
                self.sleep(self.opts.retry_interval).await;
                continue;
            }

            if due_timers.is_empty() && fetched.items.is_empty() {
                self.sleep(self.opts.idle_interval).await;
                continue;
            }

            self.tick(due_timers, fetched).await;
        }

        info!(worker = %self.key, "state worker stopped");
    }

    fn due_timers(&self) -> Vec<usize> {
        let now = now_unix();
        self.timers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(slot) if slot.next_fire <= now => Some(idx),
                _ => None,
            })
            .collect()
    }

    async fn fetch(&self) -> Result<QueueFetchResult> {
        let resp = self
            .store
            .exec_command(StoreCommand::QueueFetch {
                tenant: self.state.tenant_id,
                kind: QueueKind::Input,
                partition: self.state.index,
                group: WORKER_GROUP.to_string(),
                consumer: self.state.index,
                version: 0,
                count: self.opts.fetch_count,
                max_bytes: self.opts.fetch_max_bytes,
            })
            .await?;
        match resp {
            CommandResponse::Fetch(result) => Ok(result),
            other => Err(EngineError::Storage(StorageError::Backend(format!(
                "unexpected fetch response: {other:?}"
            )))),
        }
    }

    /// Run one tick: timers first, then queued events in queue order
    async fn tick(&mut self, due_timers: Vec<usize>, fetched: QueueFetchResult) {
        let mut tran = Transaction::start(self.pool.clone(), &self.total_crowds, &self.step_crowds);
        let mut adopted_steps: Option<Vec<CompiledStep>> = None;

        for idx in &due_timers {
            let steps = adopted_steps.as_deref().unwrap_or(&self.steps);
            tran.do_step_timer_event(steps, *idx);
        }

        for item in &fetched.items {
            let event: Event = match serde_json::from_slice(item) {
                Ok(event) => event,
                Err(e) => {
                    warn!(worker = %self.key, error = %e, "dropping undecodable event");
                    continue;
                }
            };

            match event {
                Event::User(user_event) => {
                    let steps = adopted_steps.as_deref().unwrap_or(&self.steps);
                    tran.do_step_user_events(steps, &[user_event]);
                }
                Event::UpdateCrowd { index, crowd } => {
                    if index == self.state.index {
                        tran.do_update_crowd(&crowd);
                    } else {
                        warn!(
                            worker = %self.key,
                            addressed = index,
                            "crowd update addressed to another shard"
                        );
                    }
                }
                Event::UpdateWorkflow { workflow } => {
                    match workflow.validate().map_err(EngineError::from).and_then(|_| {
                        compile_steps(&workflow)
                    }) {
                        Ok(compiled) => {
                            let old = adopted_steps.as_deref().unwrap_or(&self.steps);
                            tran.apply_workflow_update(old, &compiled);
                            adopted_steps = Some(compiled);
                        }
                        Err(e) => {
                            warn!(worker = %self.key, error = %e, "dropping invalid workflow update")
                        }
                    }
                }
            }

            if tran.err.is_some() {
                break;
            }
        }

        if let Some(err) = tran.err.take() {
            // nothing commits and the offset stays put; the next tick
            // refetches the same batch
            error!(worker = %self.key, error = %err, "tick aborted");
            self.metrics.inc_worker_failures();
            tran.abort();
            self.sleep(self.opts.retry_interval).await;
            return;
        }

        // capture before commit: an adopted snapshot renumbers the steps
        let fired_steps: Vec<String> = due_timers
            .iter()
            .map(|idx| self.state.states[*idx].step.name.clone())
            .collect();

        let outcome = tran.finish();
        if self
            .commit(&due_timers, &fetched, outcome, adopted_steps)
            .await
        {
            self.record_timer_fires(&fired_steps).await;
        }
    }

    /// Commit the tick; returns true on success
    async fn commit(
        &mut self,
        due_timers: &[usize],
        fetched: &QueueFetchResult,
        outcome: TickOutcome,
        adopted_steps: Option<Vec<CompiledStep>>,
    ) -> bool {
        let consumed = !fetched.items.is_empty();
        let state_dirty = outcome.crowd_changed || adopted_steps.is_some();

        if !state_dirty && !consumed {
            // timers fired into emptiness; only their clocks move
            outcome.release(&self.pool);
            self.reset_timers(due_timers);
            return true;
        }

        let offset = consumed.then(|| OffsetCommit {
            tenant: self.state.tenant_id,
            kind: QueueKind::Input,
            partition: self.state.index,
            group: WORKER_GROUP.to_string(),
            consumer: self.state.index,
            version: 0,
            offset: fetched.last_offset,
        });

        if !state_dirty {
            // offset-only commit
            let commit = offset.expect("consumed implies offset");
            if !self.commit_offset_only(commit).await {
                outcome.release(&self.pool);
                return false;
            }
            outcome.release(&self.pool);
            self.reset_timers(due_timers);
            return true;
        }

        let step_defs: Vec<Step> = adopted_steps
            .as_deref()
            .unwrap_or(&self.steps)
            .iter()
            .map(|c| c.step.clone())
            .collect();

        let (states, crowd_chunks) = self.build_step_states(&step_defs, &outcome.step_crowds);
        let notifies = self.build_notifies(&step_defs, &outcome.changes);

        let mut new_state = self.state.clone();
        new_state.states = states;

        let command = StoreCommand::UpdateInstanceStateShard {
            state: new_state.clone(),
            expect_version: self.state.version,
            crowd_chunks,
            notifies,
            offset,
        };

        loop {
            match self.store.exec_command(command.clone()).await {
                Ok(_) => break,
                Err(StorageError::Conflict(msg)) => {
                    // someone else wrote our shard; reload and replay
                    error!(worker = %self.key, %msg, "shard version conflict, reloading");
                    outcome.release(&self.pool);
                    self.reload_from_store().await;
                    return false;
                }
                Err(e) => {
                    warn!(worker = %self.key, error = %e, "commit failed, retrying");
                    self.metrics.inc_commit_retries();
                    self.sleep(self.opts.retry_interval).await;
                    if *self.stop_rx.borrow() {
                        outcome.release(&self.pool);
                        return false;
                    }
                }
            }
        }

        // adopt the committed tick; rearm clocks against the old step
        // layout before a new snapshot renumbers them
        self.reset_timers(due_timers);
        new_state.version = self.state.version + 1;
        self.state = new_state;
        if let Some(steps) = adopted_steps {
            self.steps = steps;
            self.timers = Self::build_timers(&self.store, &self.state, &self.steps).await;
        }

        let old_total = std::mem::replace(&mut self.total_crowds, outcome.total_crowds);
        self.pool.release(old_total);
        for old in std::mem::replace(&mut self.step_crowds, outcome.step_crowds) {
            self.pool.release(old);
        }
        for change in outcome.changes {
            self.pool.release(change.users);
        }
        true
    }

    async fn commit_offset_only(&self, commit: OffsetCommit) -> bool {
        let command = StoreCommand::QueueCommit {
            tenant: commit.tenant,
            kind: commit.kind,
            partition: commit.partition,
            group: commit.group,
            consumer: commit.consumer,
            version: commit.version,
            offset: commit.offset,
        };
        match self.store.exec_command(command).await {
            Ok(_) => true,
            Err(e) => {
                warn!(worker = %self.key, error = %e, "offset commit failed");
                self.metrics.inc_commit_retries();
                false
            }
        }
    }

    /// Serialize per-step crowds: small ones inline, large ones as a
    /// sharded-KV chunk written atomically with the state
    fn build_step_states(
        &self,
        step_defs: &[Step],
        crowds: &[RoaringBitmap],
    ) -> (Vec<StepState>, Vec<(Vec<u8>, Vec<u8>)>) {
        let mut states = Vec::with_capacity(step_defs.len());
        let mut chunks = Vec::new();

        for (step, crowd) in step_defs.iter().zip(crowds) {
            let data = hiveflow_bitmap::marshal(crowd);
            let (loader, meta) = if data.len() > self.opts.max_inline_crowd_bytes {
                let prefix = format!(
                    "{}{}-{}-",
                    String::from_utf8_lossy(&keys::crowd_prefix(
                        self.state.workflow_id,
                        self.state.instance_id
                    )),
                    step.name,
                    Uuid::new_v4()
                );
                let meta = ShardedMeta {
                    prefix: prefix.clone(),
                    chunks: 1,
                };
                chunks.push((format!("{prefix}0").into_bytes(), data));
                (LoaderKind::ShardedKv, meta.encode())
            } else {
                (LoaderKind::Raw, data)
            };

            states.push(StepState {
                step: step.clone(),
                loader,
                loader_meta: meta,
                total_crowd: crowd.len(),
            });
        }

        (states, chunks)
    }

    /// Transitions into notify-flagged or terminal steps become output rows
    fn build_notifies(&self, step_defs: &[Step], changes: &[Change]) -> Vec<Notify> {
        changes
            .iter()
            .filter(|change| {
                step_defs
                    .iter()
                    .find(|s| s.name == change.to)
                    .map(|s| s.notify || s.is_terminal())
                    .unwrap_or(false)
            })
            .map(|change| Notify {
                tenant_id: self.state.tenant_id,
                workflow_id: self.state.workflow_id,
                instance_id: self.state.instance_id,
                from_step: change.from.clone(),
                to_step: change.to.clone(),
                users: hiveflow_bitmap::marshal(&change.users),
                ttl_secs: change.ttl_secs,
            })
            .collect()
    }

    /// Persist the fired timers' last-trigger marks
    async fn record_timer_fires(&self, fired_steps: &[String]) {
        let now = now_unix();
        for name in fired_steps {
            let key =
                keys::step_last_trigger(self.state.workflow_id, self.state.instance_id, name);
            if let Err(e) = self.store.set(&key, now.to_string().into_bytes()).await {
                // next restart refires at most one interval early
                warn!(worker = %self.key, step = %name, error = %e, "last-trigger write failed");
            }
        }
    }

    fn reset_timers(&mut self, due_timers: &[usize]) {
        let now = now_unix();
        for idx in due_timers {
            if let Some(slot) = &mut self.timers[*idx] {
                slot.next_fire = now + slot.interval_secs as i64;
            }
        }
    }

    /// Drop in-memory copies and re-read the persisted shard
    async fn reload_from_store(&mut self) {
        let key = keys::worker_state(self.state.workflow_id, self.state.index);
        let state = loop {
            match self.store.get(&key).await {
                Ok(Some(data)) => match hiveflow_storage::decode::<WorkerState>("worker state", &data) {
                    Ok(state) => break state,
                    Err(e) => {
                        error!(worker = %self.key, error = %e, "cannot reload shard");
                        self.sleep(self.opts.retry_interval).await;
                    }
                },
                Ok(None) => {
                    // shard deleted underneath us; the stop signal follows
                    warn!(worker = %self.key, "shard state gone during reload");
                    return;
                }
                Err(e) => {
                    warn!(worker = %self.key, error = %e, "reload failed, retrying");
                    self.sleep(self.opts.retry_interval).await;
                }
            }
            if *self.stop_rx.borrow() {
                return;
            }
        };

        match Self::build(
            self.store.clone(),
            self.pool.clone(),
            self.opts.clone(),
            self.metrics.clone(),
            state,
            self.stop_rx.clone(),
        )
        .await
        {
            Ok(rebuilt) => {
                let old_total = std::mem::replace(&mut self.total_crowds, rebuilt.total_crowds);
                self.pool.release(old_total);
                for old in std::mem::replace(&mut self.step_crowds, rebuilt.step_crowds) {
                    self.pool.release(old);
                }
                self.state = rebuilt.state;
                self.steps = rebuilt.steps;
                self.timers = rebuilt.timers;
            }
            Err(e) => {
                error!(worker = %self.key, error = %e, "shard rebuild failed");
            }
        }
    }

    async fn sleep(&mut self, duration: std::time::Duration) {
        let stop = self.stop_rx.changed();
        tokio::select! {
            _ = stop => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
