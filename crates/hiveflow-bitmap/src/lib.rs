//! Crowd bitmap utilities
//!
//! A "crowd" is a sparse set of 32-bit user IDs represented as a roaring
//! bitmap. This crate provides the shared helpers the rest of hiveflow is
//! built on: marshal/parse in the roaring interchange format, set algebra,
//! splitting a crowd into shards of comparable cardinality, and a pool that
//! recycles bitmap allocations across worker ticks.

pub mod error;
pub mod ops;
pub mod pool;

pub use error::{BitmapError, Result};
pub use ops::{and, and_not, marshal, or, parse, parse_into, split_by_cardinality};
pub use pool::BitmapPool;

pub use roaring::RoaringBitmap;
