//! Queue event types
//!
//! Events are the items carried by the per-tenant input queues. Workers
//! consume them in partition order; the engine enqueues the update variants
//! so that definition and crowd changes are observed in-band with user
//! events.

use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};

/// A single key/value datum attached to a user event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Kv {
    pub key: String,
    pub value: String,
}

impl Kv {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An external event about one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    pub tenant_id: u64,
    pub workflow_id: u64,
    pub instance_id: u64,
    pub user_id: u32,

    /// Event payload consulted by guard expressions
    #[serde(default)]
    pub data: Vec<Kv>,
}

impl UserEvent {
    /// Look up a payload value by key
    pub fn value(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

/// A queue item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A user event to be classified and executed by the owning shard
    User(UserEvent),

    /// Replace the workflow snapshot on the consuming shard
    UpdateWorkflow { workflow: Workflow },

    /// Replace the consuming shard's total crowd
    UpdateCrowd {
        /// The shard this update is addressed to
        index: u32,

        /// Serialized bitmap: the shard's new total crowd
        #[serde(with = "serde_bytes")]
        crowd: Vec<u8>,
    },
}

/// An output-queue record describing a batch of user transitions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notify {
    pub tenant_id: u64,
    pub workflow_id: u64,
    pub instance_id: u64,

    /// Step the users left
    pub from_step: String,

    /// Step the users entered
    pub to_step: String,

    /// Serialized bitmap of the users that moved
    #[serde(with = "serde_bytes")]
    pub users: Vec<u8>,

    /// TTL of the destination step at the time of the move; 0 = none
    #[serde(default)]
    pub ttl_secs: u32,
}
