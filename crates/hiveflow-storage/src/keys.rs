//! Key layout
//!
//! Every record the engine persists lives under one of these prefixes.
//! Offsets are zero-padded decimal so that lexicographic key order matches
//! numeric order, which prefix scans and queue GC rely on.

use hiveflow_meta::QueueKind;

/// `workflow/{id}` — workflow definition
pub fn workflow(id: u64) -> Vec<u8> {
    format!("workflow/{id}").into_bytes()
}

/// `workflow/current/{id}` — the workflow's current (or last) instance
pub fn current_instance(workflow_id: u64) -> Vec<u8> {
    format!("workflow/current/{workflow_id}").into_bytes()
}

/// `workflow/history/{workflowID}/{instanceID}` — stopped-instance snapshot
pub fn history(workflow_id: u64, instance_id: u64) -> Vec<u8> {
    format!("workflow/history/{workflow_id}/{instance_id}").into_bytes()
}

/// `workflow/state/{workflowID}/{index}` — one worker shard's state
pub fn worker_state(workflow_id: u64, index: u32) -> Vec<u8> {
    format!("workflow/state/{workflow_id}/{index:010}").into_bytes()
}

/// Scan bounds covering every shard of a workflow
pub fn worker_state_range(workflow_id: u64) -> (Vec<u8>, Vec<u8>) {
    (
        format!("workflow/state/{workflow_id}/").into_bytes(),
        format!("workflow/state/{workflow_id}0").into_bytes(),
    )
}

/// `workflow/crowd/{workflowID}/{instanceID}/` — sharded-bitmap chunk prefix
pub fn crowd_prefix(workflow_id: u64, instance_id: u64) -> Vec<u8> {
    format!("workflow/crowd/{workflow_id}/{instance_id}/").into_bytes()
}

/// `workflow/lasttrigger/{workflowID}/{instanceID}/{step}` — timer bookkeeping
pub fn step_last_trigger(workflow_id: u64, instance_id: u64, step: &str) -> Vec<u8> {
    format!("workflow/lasttrigger/{workflow_id}/{instance_id}/{step}").into_bytes()
}

/// `temp/{id}` — TTL ephemeral bitmaps
pub fn temp(id: &str) -> Vec<u8> {
    format!("temp/{id}").into_bytes()
}

/// `mapping/{tenant}/{user}` — identity map
pub fn mapping(tenant: u64, user_id: u32) -> Vec<u8> {
    format!("mapping/{tenant}/{user_id}").into_bytes()
}

/// `id/{key}` — ID-allocator counter
pub fn id_counter(key: &[u8]) -> Vec<u8> {
    let mut out = b"id/".to_vec();
    out.extend_from_slice(key);
    out
}

/// `queue/meta/{tenant}/{kind}` — partition count and consumer timeout
pub fn queue_meta(tenant: u64, kind: QueueKind) -> Vec<u8> {
    format!("queue/meta/{tenant}/{}", kind.tag() as char).into_bytes()
}

/// `queue/state/{tenant}/{kind}/{group}` — consumer-group state
pub fn queue_group_state(tenant: u64, kind: QueueKind, group: &str) -> Vec<u8> {
    format!("queue/state/{tenant}/{}/{group}", kind.tag() as char).into_bytes()
}

/// `queue/part/{tenant}/{kind}/{partition}` — partition identity, embedded
/// in every per-partition key below
pub fn partition(tenant: u64, kind: QueueKind, partition: u32) -> String {
    format!("{tenant}/{}/{partition:010}", kind.tag() as char)
}

/// `queue/item/{partition}/{offset}` — one queued item
pub fn queue_item(partition: &str, offset: u64) -> Vec<u8> {
    format!("queue/item/{partition}/{offset:020}").into_bytes()
}

/// `queue/maxoff/{partition}` — highest appended offset
pub fn queue_max_offset(partition: &str) -> Vec<u8> {
    format!("queue/maxoff/{partition}").into_bytes()
}

/// `queue/removedoff/{partition}` — GC low-water mark
pub fn queue_removed_offset(partition: &str) -> Vec<u8> {
    format!("queue/removedoff/{partition}").into_bytes()
}

/// `queue/commit/{partition}/{group}` — a group's committed offset
pub fn queue_commit(partition: &str, group: &str) -> Vec<u8> {
    format!("queue/commit/{partition}/{group}").into_bytes()
}

/// Scan bounds covering every group's commit record for one partition
pub fn queue_commit_range(partition: &str) -> (Vec<u8>, Vec<u8>) {
    (
        format!("queue/commit/{partition}/").into_bytes(),
        format!("queue/commit/{partition}0").into_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_keys_sort_numerically() {
        let p = partition(10, QueueKind::Input, 0);
        let k9 = queue_item(&p, 9);
        let k10 = queue_item(&p, 10);
        let k100 = queue_item(&p, 100);
        assert!(k9 < k10);
        assert!(k10 < k100);
    }

    #[test]
    fn test_worker_state_range_covers_indices() {
        let (start, end) = worker_state_range(42);
        let k0 = worker_state(42, 0);
        let k9 = worker_state(42, 9);
        assert!(start <= k0 && k0 < end);
        assert!(start <= k9 && k9 < end);

        // a different workflow's shards fall outside the range
        let other = worker_state(43, 0);
        assert!(other >= end || other < start);
    }

    #[test]
    fn test_partition_keys_distinct_by_kind() {
        let input = partition(1, QueueKind::Input, 0);
        let output = partition(1, QueueKind::Output, 0);
        assert_ne!(input, output);
    }

    #[test]
    fn test_commit_range_covers_groups() {
        let p = partition(1, QueueKind::Input, 2);
        let (start, end) = queue_commit_range(&p);
        let k = queue_commit(&p, "g1");
        assert!(start <= k && k < end);
    }
}
