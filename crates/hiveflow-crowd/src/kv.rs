//! KV loader: a single key read back in pages
//!
//! The metadata is the key of a server-side bitmap. Reads page through the
//! `BmRange` command so a huge crowd never crosses the wire in one
//! response. This loader is read-only; writes go through the raw or
//! sharded-KV paths.

use crate::error::{CrowdError, Result};
use crate::loader::CrowdLoader;
use async_trait::async_trait;
use hiveflow_bitmap::RoaringBitmap;
use hiveflow_storage::{CommandResponse, Storage, StoreCommand};
use std::sync::Arc;
use tracing::info;

/// IDs fetched per `BmRange` page
const PAGE: u64 = 80_000;

/// Read-only loader over a single server-side bitmap key
pub struct KvLoader {
    store: Arc<dyn Storage>,
}

impl KvLoader {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CrowdLoader for KvLoader {
    async fn get(&self, meta: &[u8]) -> Result<RoaringBitmap> {
        let mut bm = RoaringBitmap::new();
        let mut start = 0u32;

        loop {
            let resp = self
                .store
                .exec_command(StoreCommand::BmRange {
                    key: meta.to_vec(),
                    start,
                    limit: PAGE,
                })
                .await?;
            let values = match resp {
                CommandResponse::Uint32Slice(values) => values,
                other => {
                    return Err(CrowdError::InvalidMeta(format!(
                        "unexpected range response: {other:?}"
                    )))
                }
            };

            if values.is_empty() {
                break;
            }
            bm.extend(values);
            match bm.max() {
                Some(max) if max < u32::MAX => start = max + 1,
                _ => break,
            }
        }

        info!(
            crowd = bm.len(),
            key = %String::from_utf8_lossy(meta),
            "loaded crowd from KV"
        );
        Ok(bm)
    }

    async fn set(&self, _key_prefix: &str, _bm: &RoaringBitmap) -> Result<Vec<u8>> {
        Err(CrowdError::ReadOnlyLoader)
    }

    async fn remove(&self, _meta: &[u8]) -> Result<()> {
        Ok(())
    }
}
