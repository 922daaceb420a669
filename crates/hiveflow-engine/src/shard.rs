//! Instance sharding and event routing
//!
//! An instance's crowd is split into contiguous-cardinality runs; the
//! `[start, end)` boundaries double as the routing table mapping a user ID
//! to its shard. Ranges are cached per instance for O(1) routing and
//! invalidated when the instance stops.

use hiveflow_bitmap::RoaringBitmap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shard routing ranges of one instance, in shard-index order
pub(crate) type ShardRanges = Arc<Vec<(u32, u32)>>;

/// Compute the `[start, end)` range of each shard bitmap
///
/// Empty shards get a collapsed `(0, 0)` range; no user routes to them.
pub(crate) fn shard_ranges(shards: &[RoaringBitmap]) -> Vec<(u32, u32)> {
    shards
        .iter()
        .map(|bm| match (bm.min(), bm.max()) {
            (Some(min), Some(max)) => (min, max + 1),
            _ => (0, 0),
        })
        .collect()
}

/// Cache of instance routing ranges
///
/// A stopped instance keeps an empty entry so late events are recognized as
/// addressed to a dead instance rather than triggering a reload.
#[derive(Debug, Default)]
pub(crate) struct RangeCache {
    ranges: RwLock<HashMap<u64, ShardRanges>>,
}

impl RangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: u64) -> Option<ShardRanges> {
        self.ranges
            .read()
            .expect("range cache lock poisoned")
            .get(&instance_id)
            .cloned()
    }

    pub fn put(&self, instance_id: u64, ranges: Vec<(u32, u32)>) -> ShardRanges {
        let ranges = Arc::new(ranges);
        self.ranges
            .write()
            .expect("range cache lock poisoned")
            .insert(instance_id, ranges.clone());
        ranges
    }

    /// Mark an instance stopped; lookups return an empty range list
    pub fn mark_stopped(&self, instance_id: u64) {
        self.put(instance_id, Vec::new());
    }

    /// Extend the last shard's range to cover IDs up to `end`
    pub fn extend_last(&self, instance_id: u64, end: u32) {
        let mut guard = self.ranges.write().expect("range cache lock poisoned");
        if let Some(ranges) = guard.get(&instance_id) {
            if let Some((_, last_end)) = ranges.last() {
                if end > *last_end {
                    let mut updated = ranges.as_ref().clone();
                    let last = updated.len() - 1;
                    updated[last].1 = end;
                    guard.insert(instance_id, Arc::new(updated));
                }
            }
        }
    }
}

/// Find the shard whose range covers `user_id`
pub(crate) fn route(ranges: &[(u32, u32)], user_id: u32) -> Option<u32> {
    ranges
        .iter()
        .position(|(start, end)| user_id >= *start && user_id < *end)
        .map(|i| i as u32)
}
