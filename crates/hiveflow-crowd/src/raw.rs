//! Inline-raw loader: the metadata is the serialized bitmap

use crate::error::Result;
use crate::loader::CrowdLoader;
use async_trait::async_trait;
use hiveflow_bitmap::RoaringBitmap;

/// Loader whose metadata carries the bitmap inline
///
/// Used for per-step crowds small enough to live inside the worker-state
/// record.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawLoader;

#[async_trait]
impl CrowdLoader for RawLoader {
    async fn get(&self, meta: &[u8]) -> Result<RoaringBitmap> {
        Ok(hiveflow_bitmap::parse(meta)?)
    }

    async fn set(&self, _key_prefix: &str, bm: &RoaringBitmap) -> Result<Vec<u8>> {
        Ok(hiveflow_bitmap::marshal(bm))
    }

    async fn remove(&self, _meta: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_roundtrip() {
        let loader = RawLoader;
        let bm: RoaringBitmap = [1u32, 2, 3].into_iter().collect();

        let meta = loader.set("ignored", &bm).await.unwrap();
        let loaded = loader.get(&meta).await.unwrap();
        assert_eq!(loaded, bm);
    }

    #[tokio::test]
    async fn test_raw_empty_meta_is_empty_crowd() {
        let loader = RawLoader;
        let loaded = loader.get(&[]).await.unwrap();
        assert!(loaded.is_empty());
    }
}
