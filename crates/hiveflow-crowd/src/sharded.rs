//! Sharded-KV loader: one bitmap chunked across many keys
//!
//! Instance-level crowds can run to hundreds of millions of users; storing
//! them as one value would blow past the store's value-size budget. This
//! loader splits a bitmap into fixed-cardinality chunks under a key prefix
//! and records `{prefix, chunks}` as its metadata. Chunks are deleted when
//! the owning instance stops.

use crate::error::{CrowdError, Result};
use crate::loader::CrowdLoader;
use async_trait::async_trait;
use hiveflow_bitmap::RoaringBitmap;
use hiveflow_storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// IDs per stored chunk
const IDS_PER_CHUNK: u64 = 1_000_000;

/// Metadata of a sharded crowd
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShardedMeta {
    /// Key prefix the chunks live under
    pub prefix: String,

    /// Number of chunks written
    pub chunks: u32,
}

impl ShardedMeta {
    pub fn parse(meta: &[u8]) -> Result<Self> {
        serde_json::from_slice(meta)
            .map_err(|e| CrowdError::InvalidMeta(format!("sharded meta: {e}")))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("sharded meta serializes")
    }

    fn chunk_key(&self, index: u32) -> Vec<u8> {
        format!("{}{}", self.prefix, index).into_bytes()
    }
}

/// Writable loader storing a crowd as cardinality-bounded chunks
pub struct ShardedKvLoader {
    store: Arc<dyn Storage>,
}

impl ShardedKvLoader {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CrowdLoader for ShardedKvLoader {
    async fn get(&self, meta: &[u8]) -> Result<RoaringBitmap> {
        let meta = ShardedMeta::parse(meta)?;
        let mut bm = RoaringBitmap::new();

        for index in 0..meta.chunks {
            let key = meta.chunk_key(index);
            let data = self.store.get(&key).await?.ok_or_else(|| {
                CrowdError::MissingChunk(String::from_utf8_lossy(&key).into_owned())
            })?;
            bm |= hiveflow_bitmap::parse(&data)?;
        }

        info!(crowd = bm.len(), prefix = %meta.prefix, chunks = meta.chunks, "loaded sharded crowd");
        Ok(bm)
    }

    async fn set(&self, key_prefix: &str, bm: &RoaringBitmap) -> Result<Vec<u8>> {
        let chunk_count = bm.len().div_ceil(IDS_PER_CHUNK).max(1) as u32;
        let meta = ShardedMeta {
            prefix: key_prefix.to_string(),
            chunks: chunk_count,
        };

        let mut chunk = RoaringBitmap::new();
        let mut index = 0u32;
        for id in bm.iter() {
            chunk.insert(id);
            if chunk.len() >= IDS_PER_CHUNK {
                self.store
                    .set(&meta.chunk_key(index), hiveflow_bitmap::marshal(&chunk))
                    .await?;
                chunk.clear();
                index += 1;
            }
        }
        // the final (possibly empty) chunk keeps get() total
        if index < chunk_count {
            self.store
                .set(&meta.chunk_key(index), hiveflow_bitmap::marshal(&chunk))
                .await?;
        }

        Ok(meta.encode())
    }

    async fn remove(&self, meta: &[u8]) -> Result<()> {
        let meta = ShardedMeta::parse(meta)?;
        for index in 0..meta.chunks {
            self.store.delete(&meta.chunk_key(index)).await?;
        }
        Ok(())
    }
}
