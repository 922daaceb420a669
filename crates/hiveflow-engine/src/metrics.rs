//! Engine counters
//!
//! Plain atomics surfaced through accessors; an observability layer can
//! poll them without the engine depending on one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-visible engine counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    worker_failures: AtomicU64,
    commit_retries: AtomicU64,
    lifecycle_retries: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_worker_failures(&self) {
        self.worker_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_commit_retries(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_lifecycle_retries(&self) {
        self.lifecycle_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Ticks aborted by a step failure
    pub fn worker_failures(&self) -> u64 {
        self.worker_failures.load(Ordering::Relaxed)
    }

    /// Commit attempts that had to be repeated
    pub fn commit_retries(&self) -> u64 {
        self.commit_retries.load(Ordering::Relaxed)
    }

    /// Instance lifecycle commands rescheduled after an error
    pub fn lifecycle_retries(&self) -> u64 {
        self.lifecycle_retries.load(Ordering::Relaxed)
    }
}
