//! Engine tuning options

use std::time::Duration;

/// Engine tuning options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Pause before retrying a failed lifecycle command
    pub retry_interval: Duration,

    /// Items fetched per worker tick
    pub fetch_count: usize,

    /// Byte budget per worker fetch
    pub fetch_max_bytes: usize,

    /// Worker sleep when its queue is empty
    pub idle_interval: Duration,

    /// TTL of history snapshots, seconds
    pub history_ttl_secs: u64,

    /// TTL of temp step-crowd results, seconds
    pub temp_ttl_secs: u64,

    /// Per-step crowds larger than this move from inline metadata to a
    /// sharded-KV chunk
    pub max_inline_crowd_bytes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            fetch_count: 64,
            fetch_max_bytes: 1 << 20,
            idle_interval: Duration::from_millis(100),
            history_ttl_secs: 30 * 24 * 60 * 60,
            temp_ttl_secs: 300,
            max_inline_crowd_bytes: 1 << 20,
        }
    }
}

impl EngineOptions {
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_fetch_count(mut self, count: usize) -> Self {
        self.fetch_count = count;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_history_ttl(mut self, secs: u64) -> Self {
        self.history_ttl_secs = secs;
        self
    }
}
