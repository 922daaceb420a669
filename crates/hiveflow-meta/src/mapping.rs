//! Tenant-scoped identity mappings
//!
//! A user may be known under several identity types (device ID, phone
//! number, CRM key). Updates merge by type; the latest write wins per type.

use serde::{Deserialize, Serialize};

/// One typed identity value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdValue {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

impl IdValue {
    pub fn new(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            value: value.into(),
        }
    }
}

/// The set of identities known for one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IdSet {
    pub values: Vec<IdValue>,
}

impl IdSet {
    /// Merge `update` into this set; values with a matching type are
    /// replaced, the rest appended.
    pub fn merge(&mut self, update: IdSet) {
        for incoming in update.values {
            match self
                .values
                .iter_mut()
                .find(|v| v.id_type == incoming.id_type)
            {
                Some(existing) => existing.value = incoming.value,
                None => self.values.push(incoming),
            }
        }
    }

    /// Look up the value of one identity type
    pub fn get(&self, id_type: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.id_type == id_type)
            .map(|v| v.value.as_str())
    }
}
