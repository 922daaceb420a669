//! Set algebra and serialization helpers
//!
//! All persisted crowds use the portable roaring serialization so that
//! payloads written by one node can be parsed by any other.

use crate::error::{BitmapError, Result};
use roaring::RoaringBitmap;

/// Serialize a bitmap into the portable roaring format
pub fn marshal(bm: &RoaringBitmap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bm.serialized_size());
    bm.serialize_into(&mut buf)
        .expect("serializing a bitmap into memory cannot fail");
    buf
}

/// Parse a bitmap from its serialized form
///
/// An empty slice parses as the empty crowd; per-step crowds are
/// initialized that way when an instance starts.
pub fn parse(data: &[u8]) -> Result<RoaringBitmap> {
    if data.is_empty() {
        return Ok(RoaringBitmap::new());
    }

    RoaringBitmap::deserialize_from(data).map_err(|e| BitmapError::Corrupted(e.to_string()))
}

/// Parse a bitmap, replacing the contents of `target`
pub fn parse_into(data: &[u8], target: &mut RoaringBitmap) -> Result<()> {
    target.clear();
    if !data.is_empty() {
        *target |= parse(data)?;
    }
    Ok(())
}

/// `a OR b` into a fresh bitmap
pub fn or(a: &RoaringBitmap, b: &RoaringBitmap) -> RoaringBitmap {
    a | b
}

/// `a AND b` into a fresh bitmap
pub fn and(a: &RoaringBitmap, b: &RoaringBitmap) -> RoaringBitmap {
    a & b
}

/// `a AND NOT b` into a fresh bitmap
pub fn and_not(a: &RoaringBitmap, b: &RoaringBitmap) -> RoaringBitmap {
    a - b
}

/// Split a crowd into `shards` bitmaps of comparable cardinality
///
/// Each shard holds a contiguous run of user IDs, so a shard can be
/// identified by the `[min, max+1)` range it covers and events routed to it
/// with a single range check. Trailing shards may be empty when the crowd is
/// smaller than the shard count.
pub fn split_by_cardinality(bm: &RoaringBitmap, shards: u32) -> Vec<RoaringBitmap> {
    let shards = shards.max(1) as usize;
    let per_shard = (bm.len() as usize).div_ceil(shards).max(1);

    let mut out: Vec<RoaringBitmap> = Vec::with_capacity(shards);
    let mut current = RoaringBitmap::new();
    for id in bm.iter() {
        current.insert(id);
        if current.len() as usize >= per_shard && out.len() < shards - 1 {
            out.push(std::mem::take(&mut current));
        }
    }
    out.push(current);

    while out.len() < shards {
        out.push(RoaringBitmap::new());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crowd(ids: impl IntoIterator<Item = u32>) -> RoaringBitmap {
        ids.into_iter().collect()
    }

    #[test]
    fn test_marshal_parse_roundtrip() {
        let bm = crowd([1, 2, 3, 100, 70_000]);
        let data = marshal(&bm);
        let parsed = parse(&data).unwrap();
        assert_eq!(bm, parsed);

        let mut target = crowd([9]);
        parse_into(&data, &mut target).unwrap();
        assert_eq!(bm, target);
    }

    #[test]
    fn test_parse_empty_slice() {
        let bm = parse(&[]).unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_parse_corrupted() {
        let result = parse(b"not a bitmap");
        assert!(matches!(result, Err(BitmapError::Corrupted(_))));
    }

    #[test]
    fn test_set_algebra() {
        let a = crowd([1, 2, 3, 4]);
        let b = crowd([3, 4, 5]);

        assert_eq!(or(&a, &b), crowd([1, 2, 3, 4, 5]));
        assert_eq!(and(&a, &b), crowd([3, 4]));
        assert_eq!(and_not(&a, &b), crowd([1, 2]));
    }

    #[test]
    fn test_split_even() {
        let bm = crowd(1..=1000);
        let shards = split_by_cardinality(&bm, 4);

        assert_eq!(shards.len(), 4);
        for shard in &shards {
            assert_eq!(shard.len(), 250);
        }
        assert_eq!(shards[0].min(), Some(1));
        assert_eq!(shards[0].max(), Some(250));
        assert_eq!(shards[1].min(), Some(251));
        assert_eq!(shards[2].min(), Some(501));
        assert_eq!(shards[3].max(), Some(1000));
    }

    #[test]
    fn test_split_uneven() {
        let bm = crowd(1..=10);
        let shards = split_by_cardinality(&bm, 3);

        assert_eq!(shards.len(), 3);
        let total: u64 = shards.iter().map(|s| s.len()).sum();
        assert_eq!(total, 10);
        // contiguous, sorted ranges
        assert!(shards[0].max().unwrap() < shards[1].min().unwrap());
        assert!(shards[1].max().unwrap() < shards[2].min().unwrap());
    }

    #[test]
    fn test_split_smaller_than_shards() {
        let bm = crowd([7, 9]);
        let shards = split_by_cardinality(&bm, 4);

        assert_eq!(shards.len(), 4);
        assert_eq!(shards.iter().map(|s| s.len()).sum::<u64>(), 2);
        assert!(shards[3].is_empty());
    }

    #[test]
    fn test_split_empty_crowd() {
        let shards = split_by_cardinality(&RoaringBitmap::new(), 3);
        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(|s| s.is_empty()));
    }
}
