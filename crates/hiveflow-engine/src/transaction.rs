//! One tick's worth of crowd mutations
//!
//! A transaction copies the shard's step crowds at tick start, applies
//! every event of the tick in memory, and hands the worker a new state plus
//! the coalesced transition records to commit in one storage command. It
//! never touches durable state itself, which is what makes a tick replay
//! idempotent: the resulting state is a pure function of the persisted
//! state and the unconsumed queue suffix.

use crate::error::EngineError;
use crate::step::{CompiledExecution, CompiledStep};
use hiveflow_bitmap::{BitmapPool, RoaringBitmap};
use hiveflow_expr::ExprContext;
use hiveflow_meta::UserEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// The users a transition applies to
#[derive(Debug)]
pub(crate) enum Who {
    One(u32),
    Many(RoaringBitmap),
}

/// A coalesced transition record: all users that moved `from -> to` within
/// one tick
#[derive(Debug)]
pub(crate) struct Change {
    pub from: String,
    pub to: String,
    pub users: RoaringBitmap,
    pub ttl_secs: u32,
}

/// What a finished transaction hands back to the worker
pub(crate) struct TickOutcome {
    pub total_crowds: RoaringBitmap,
    pub step_crowds: Vec<RoaringBitmap>,
    pub changes: Vec<Change>,
    pub crowd_changed: bool,
}

impl TickOutcome {
    pub fn release(self, pool: &BitmapPool) {
        pool.release(self.total_crowds);
        for bm in self.step_crowds {
            pool.release(bm);
        }
        for change in self.changes {
            pool.release(change.users);
        }
    }
}

pub(crate) struct Transaction {
    pool: Arc<BitmapPool>,

    total_crowds: RoaringBitmap,
    step_crowds: Vec<RoaringBitmap>,

    changes: Vec<Change>,
    crowd_changed: bool,

    /// Sticky: once set, the remainder of the tick short-circuits
    pub err: Option<EngineError>,
}

impl Transaction {
    /// Copy the worker's crowds into pooled scratch bitmaps
    pub fn start(
        pool: Arc<BitmapPool>,
        total_crowds: &RoaringBitmap,
        step_crowds: &[RoaringBitmap],
    ) -> Self {
        let total = pool.acquire_copy(total_crowds);
        let steps = step_crowds.iter().map(|bm| pool.acquire_copy(bm)).collect();
        Self {
            pool,
            total_crowds: total,
            step_crowds: steps,
            changes: Vec::new(),
            crowd_changed: false,
            err: None,
        }
    }

    /// Fire a timer step: filter its crowd and bulk-move the matches
    pub fn do_step_timer_event(&mut self, steps: &[CompiledStep], idx: usize) {
        if self.err.is_some() {
            return;
        }

        let CompiledExecution::Timer { expr, target, .. } = &steps[idx].execution else {
            return;
        };

        let matched = expr.filter(&self.step_crowds[idx]);
        debug!(step = %steps[idx].step.name, matched = matched.len(), "timer fired");
        if matched.is_empty() {
            return;
        }

        let from = steps[idx].step.name.clone();
        let target = target.clone();
        self.step_changed(steps, &from, &target, Who::Many(matched));
    }

    /// Classify each user event to the step currently holding the user and
    /// evaluate that step. Users outside every step crowd have left the
    /// instance (or were never admitted) and are skipped.
    pub fn do_step_user_events(&mut self, steps: &[CompiledStep], events: &[UserEvent]) {
        for event in events {
            if self.err.is_some() {
                return;
            }

            let Some(idx) = self
                .step_crowds
                .iter()
                .position(|crowd| crowd.contains(event.user_id))
            else {
                continue;
            };

            let from = steps[idx].step.name.clone();
            match &steps[idx].execution {
                CompiledExecution::Conditional { branches } => {
                    let ctx = ExprContext::new(event.user_id, &event.data);
                    let target = branches
                        .iter()
                        .find(|(expr, _)| expr.eval(&ctx))
                        .map(|(_, target)| target.clone());
                    if let Some(target) = target {
                        self.step_changed(steps, &from, &target, Who::One(event.user_id));
                    }
                }
                CompiledExecution::Direct { target } => {
                    let target = target.clone();
                    self.step_changed(steps, &from, &target, Who::One(event.user_id));
                }
                // timer steps move users only when the timer fires
                CompiledExecution::Timer { .. } => {}
            }
        }
    }

    /// Replace the shard's total crowd
    ///
    /// Newly added users are admitted into step 0; users absent from the
    /// new total are dropped from every step.
    pub fn do_update_crowd(&mut self, new_total_bytes: &[u8]) {
        if self.err.is_some() {
            return;
        }

        let new_total = match hiveflow_bitmap::parse(new_total_bytes) {
            Ok(bm) => bm,
            Err(e) => {
                // a corrupted update can never apply; consume and move on
                warn!(error = %e, "dropping unparsable crowd update");
                return;
            }
        };

        let new_added = hiveflow_bitmap::and_not(&new_total, &self.total_crowds);
        self.total_crowds.clear();
        self.total_crowds |= &new_total;

        for (idx, crowd) in self.step_crowds.iter_mut().enumerate() {
            if idx == 0 {
                *crowd |= &new_added;
            }
            *crowd &= &new_total;
        }

        self.crowd_changed = true;
    }

    /// Adopt a rewritten workflow snapshot mid-stream
    ///
    /// Crowds carry over by step name. Users sitting in a step that no
    /// longer exists are re-admitted into step 0 so the shard's total crowd
    /// is preserved.
    pub fn apply_workflow_update(&mut self, old_steps: &[CompiledStep], new_steps: &[CompiledStep]) {
        if self.err.is_some() || new_steps.is_empty() {
            return;
        }

        let mut new_crowds: Vec<RoaringBitmap> =
            new_steps.iter().map(|_| self.pool.acquire()).collect();
        let mut orphans = self.pool.acquire();

        for (old_idx, old) in old_steps.iter().enumerate() {
            let crowd = std::mem::take(&mut self.step_crowds[old_idx]);
            match new_steps
                .iter()
                .position(|s| s.step.name == old.step.name)
            {
                Some(new_idx) => new_crowds[new_idx] |= &crowd,
                None => orphans |= &crowd,
            }
            self.pool.release(crowd);
        }

        new_crowds[0] |= &orphans;
        self.pool.release(orphans);

        for old in std::mem::replace(&mut self.step_crowds, new_crowds) {
            self.pool.release(old);
        }
        self.crowd_changed = true;
    }

    /// Apply one transition reported by a step evaluation
    fn step_changed(&mut self, steps: &[CompiledStep], from: &str, to: &str, who: Who) {
        let who = match who {
            Who::Many(mut users) => {
                // bulk selections may span the whole instance; scope them
                // to this shard
                users &= &self.total_crowds;
                if users.is_empty() {
                    return;
                }
                Who::Many(users)
            }
            one => one,
        };

        for idx in 0..steps.len() {
            if steps[idx].step.name == from {
                self.remove_from_step(idx, &who);
            } else if steps[idx].step.name == to {
                let changed = self.move_to_step(idx, &who);
                if changed {
                    self.add_change(from, to, &who, steps[idx].step.ttl_secs);
                    self.trigger_direct_chain(steps, idx, &who);
                }
            }
        }
    }

    /// Entering a direct step routes onward immediately, hop by hop, until
    /// a non-direct step is reached. One change record is emitted per hop
    /// so downstream notifications fire for each edge.
    fn trigger_direct_chain(&mut self, steps: &[CompiledStep], entered_idx: usize, who: &Who) {
        let Some(first_target) = steps[entered_idx].direct_target() else {
            return;
        };

        let mut from = steps[entered_idx].step.name.clone();
        let mut to = first_target.to_string();
        let mut hops = 0usize;
        let final_idx = loop {
            // validation rejects direct cycles; this bound guards against
            // a validator bug reaching the runtime
            hops += 1;
            if hops > steps.len() {
                self.err = Some(EngineError::Invariant(format!(
                    "direct chain from '{from}' exceeds step count"
                )));
                return;
            }

            self.add_change(&from, &to, who, 0);

            let Some(next_idx) = steps.iter().position(|s| s.step.name == to) else {
                self.err = Some(EngineError::Invariant(format!(
                    "direct step targets unknown step '{to}'"
                )));
                return;
            };
            match steps[next_idx].direct_target() {
                Some(next) => {
                    from = to;
                    to = next.to_string();
                }
                None => break next_idx,
            }
        };

        self.remove_from_step(entered_idx, who);
        self.move_to_step(final_idx, who);
    }

    /// Returns true iff the step's cardinality decreased
    fn remove_from_step(&mut self, idx: usize, who: &Who) -> bool {
        match who {
            Who::One(user) => self.step_crowds[idx].remove(*user),
            Who::Many(users) => {
                let before = self.step_crowds[idx].len();
                self.step_crowds[idx] -= users;
                self.step_crowds[idx].len() < before
            }
        }
    }

    /// Returns true iff the step's cardinality increased
    fn move_to_step(&mut self, idx: usize, who: &Who) -> bool {
        match who {
            Who::One(user) => self.step_crowds[idx].insert(*user),
            Who::Many(users) => {
                let before = self.step_crowds[idx].len();
                self.step_crowds[idx] |= users;
                self.step_crowds[idx].len() > before
            }
        }
    }

    /// Merge into the change record for this `(from, to)` edge
    fn add_change(&mut self, from: &str, to: &str, who: &Who, ttl_secs: u32) {
        let change = match self
            .changes
            .iter_mut()
            .find(|c| c.from == from && c.to == to)
        {
            Some(change) => change,
            None => {
                self.changes.push(Change {
                    from: from.to_string(),
                    to: to.to_string(),
                    users: self.pool.acquire(),
                    ttl_secs,
                });
                self.changes.last_mut().expect("just pushed")
            }
        };

        match who {
            Who::One(user) => {
                change.users.insert(*user);
            }
            Who::Many(users) => change.users |= users,
        }
        self.crowd_changed = true;
    }

    /// Hand the results to the worker; the caller owns the bitmaps now
    pub fn finish(self) -> TickOutcome {
        TickOutcome {
            total_crowds: self.total_crowds,
            step_crowds: self.step_crowds,
            changes: self.changes,
            crowd_changed: self.crowd_changed,
        }
    }

    /// Abort the tick, returning every bitmap to the pool
    pub fn abort(self) {
        let pool = self.pool.clone();
        self.finish().release(&pool);
    }
}
