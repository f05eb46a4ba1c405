//! Strata Runtime - lazy OCI image engine.
//!
//! This crate indexes registry images into archives, resolves file content
//! on demand through the disk and remote caches, and exposes the filesystem
//! view consumed by a protocol server. Local directory trees can also be
//! packed into self-contained archives.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod embed;
pub mod fs;
pub mod index;
pub mod oci;
pub mod resolve;

// Re-export common types
pub use cache::{ContentCache, DiskCache, HttpContentCache, MemoryContentCache};
pub use embed::{create_archive, extract_archive, CreateSummary, ExtractSummary};
pub use fs::{ContentBackend, DirEntry, FileAttr, FileType, LazyImage};
pub use index::{index_image, ImageSource, Indexer};
pub use oci::{CredentialChain, HttpRegistryClient, ImageReference, LayoutRegistry, RegistryClient, RegistryRouter};
pub use resolve::{InFlight, LayerOrigin, Resolver};

/// Strata Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
