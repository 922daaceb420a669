//! The loader trait and factory

use crate::error::Result;
use crate::kv::KvLoader;
use crate::raw::RawLoader;
use crate::sharded::ShardedKvLoader;
use async_trait::async_trait;
use hiveflow_bitmap::RoaringBitmap;
use hiveflow_meta::LoaderKind;
use hiveflow_storage::Storage;
use std::sync::Arc;

/// Materializes crowd bitmaps from opaque loader metadata
///
/// Loaded bitmaps are values: the caller owns the returned bitmap and the
/// loader keeps no reference to it.
#[async_trait]
pub trait CrowdLoader: Send + Sync {
    /// Resolve metadata to a bitmap
    async fn get(&self, meta: &[u8]) -> Result<RoaringBitmap>;

    /// Persist a bitmap under `key_prefix`; returns the metadata that will
    /// load it back. Read-only loaders refuse.
    async fn set(&self, key_prefix: &str, bm: &RoaringBitmap) -> Result<Vec<u8>>;

    /// Delete whatever `set` persisted; a no-op for loaders that own no
    /// storage
    async fn remove(&self, meta: &[u8]) -> Result<()>;
}

/// Build the loader for a kind over the given store
pub fn new_loader(kind: LoaderKind, store: Arc<dyn Storage>) -> Arc<dyn CrowdLoader> {
    match kind {
        LoaderKind::Raw => Arc::new(RawLoader),
        LoaderKind::Kv => Arc::new(KvLoader::new(store)),
        LoaderKind::ShardedKv => Arc::new(ShardedKvLoader::new(store)),
    }
}
