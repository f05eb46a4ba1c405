//! Layer content caches.
//!
//! - `DiskCache`: local directory of fully decompressed layers
//! - `ContentCache`: range-readable remote store shared across hosts

pub mod disk;
pub mod remote;

pub use disk::{CacheWriter, DiskCache, LayerMeta};
pub use remote::{ContentCache, HttpContentCache, MemoryContentCache};
