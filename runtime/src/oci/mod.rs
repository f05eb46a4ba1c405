//! OCI registry access.
//!
//! Everything the indexer and resolver need to talk to image sources:
//!
//! - Image references and repository coordinates
//! - Registry credentials (env, credential store, Docker config, helpers)
//! - The HTTP distribution client with range blob fetches
//! - Local OCI image layouts served through the same interface
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     RegistryRouter                        │
//! │                                                           │
//! │   "oci-layout" ──► LayoutRegistry   (blobs/sha256/...)    │
//! │   otherwise    ──► HttpRegistryClient                     │
//! │                      └─ CredentialChain                   │
//! │                          env → store → docker config      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod credentials;
pub mod layout;
pub mod reference;
pub mod registry;

pub use auth::{
    Anonymous, CallbackCredentials, Credential, CredentialChain, CredentialSource,
    DockerConfigCredentials, EnvCredentials, MemoizedCredentials, StaticCredentials,
};
pub use credentials::CredentialStore;
pub use layout::{LayoutRegistry, LAYOUT_REGISTRY};
pub use reference::{ImageReference, RepositoryRef};
pub use registry::{
    BlobStream, HttpRegistryClient, ImageManifestInfo, LayerDescriptor, RegistryClient,
    RegistryRouter,
};
