//! Pooled bitmap reuse
//!
//! Worker ticks copy every step crowd before mutating it; the pool recycles
//! those allocations. Ownership transfers on acquire/release: a released
//! bitmap must not be referenced again.

use roaring::RoaringBitmap;
use std::sync::Mutex;

/// A pool of reusable bitmaps
///
/// Held as a field on the engine (never a process global) so that several
/// engines can coexist in one test binary.
#[derive(Debug, Default)]
pub struct BitmapPool {
    free: Mutex<Vec<RoaringBitmap>>,
}

impl BitmapPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an empty bitmap out of the pool
    pub fn acquire(&self) -> RoaringBitmap {
        self.free
            .lock()
            .expect("bitmap pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Take a bitmap holding a copy of `src`
    pub fn acquire_copy(&self, src: &RoaringBitmap) -> RoaringBitmap {
        let mut bm = self.acquire();
        bm |= src;
        bm
    }

    /// Return a bitmap to the pool; its contents are discarded
    pub fn release(&self, mut bm: RoaringBitmap) {
        bm.clear();
        self.free
            .lock()
            .expect("bitmap pool lock poisoned")
            .push(bm);
    }

    /// Number of idle bitmaps currently pooled
    pub fn idle(&self) -> usize {
        self.free.lock().expect("bitmap pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = BitmapPool::new();
        assert_eq!(pool.idle(), 0);

        let mut bm = pool.acquire();
        bm.insert(42);
        pool.release(bm);
        assert_eq!(pool.idle(), 1);

        // recycled bitmap comes back empty
        let bm = pool.acquire();
        assert!(bm.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_acquire_copy() {
        let pool = BitmapPool::new();
        let src: RoaringBitmap = [1u32, 2, 3].into_iter().collect();

        let copy = pool.acquire_copy(&src);
        assert_eq!(copy, src);
    }
}
