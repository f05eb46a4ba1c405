//! Strata Core - Foundational Types
//!
//! Index nodes, checkpoint tables, the path index, the archive file format,
//! configuration and the error taxonomy shared by the indexer, the resolver
//! and the filesystem adapter.

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod digest;
pub mod error;
pub mod index;
pub mod node;

// Re-export commonly used types
pub use archive::{ArchiveMetadata, RegistryCoordinates, StorageMode, ARCHIVE_VERSION};
pub use checkpoint::{Checkpoint, CheckpointTable};
pub use config::{CacheConfig, IndexConfig, LogLevel, RegistryConfig, StrataConfig};
pub use error::{Result, StrataError};
pub use index::{normalize_path, FsIndex};
pub use node::{ContentRef, IndexNode, NodeAttr, NodeKind, RemoteRef, Timestamp};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
