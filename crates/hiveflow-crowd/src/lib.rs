//! Crowd loaders
//!
//! A crowd bitmap is referenced by a `LoaderKind` plus opaque metadata and
//! materialized on demand. Three loaders cover the deployment spectrum:
//! raw (the metadata is the bitmap itself), KV (a single key read back in
//! pages), and sharded KV (chunked under a key prefix, the only writable
//! form suitable for very large crowds).

pub mod error;
pub mod kv;
pub mod loader;
pub mod raw;
pub mod sharded;

pub use error::{CrowdError, Result};
pub use kv::KvLoader;
pub use loader::{new_loader, CrowdLoader};
pub use raw::RawLoader;
pub use sharded::{ShardedKvLoader, ShardedMeta};
