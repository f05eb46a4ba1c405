//! OCI image layout on local disk, served through the registry interface.
//!
//! ```text
//! image/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/<manifest, config, layers>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use oci_spec::image::{ImageIndex, ImageManifest};
use strata_core::digest::safe_file_name;
use strata_core::error::{Result, StrataError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::reference::{ImageReference, RepositoryRef};
use super::registry::{linux_platform_manifest, BlobStream, ImageManifestInfo, RegistryClient};

/// Registry name used in coordinates of images indexed from a layout.
pub const LAYOUT_REGISTRY: &str = "oci-layout";

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const CHUNK_SIZE: usize = 64 * 1024;

/// Serves manifests and blobs out of OCI layout directories.
///
/// The repository of a [`RepositoryRef`] is the layout's absolute path.
#[derive(Debug, Default, Clone)]
pub struct LayoutRegistry;

impl LayoutRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Reference naming `tag` inside the layout at `path`.
    pub fn reference(path: &Path, tag: Option<&str>) -> Result<ImageReference> {
        let root = std::fs::canonicalize(path).map_err(|e| {
            StrataError::InvalidReference(format!(
                "Failed to resolve OCI layout {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(ImageReference {
            registry: LAYOUT_REGISTRY.to_string(),
            repository: root.to_string_lossy().into_owned(),
            tag: tag.map(str::to_string),
            digest: None,
        })
    }

    /// Check the directory has the layout marker, index, and blob store.
    pub fn validate(root: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root.join(required).exists() {
                return Err(StrataError::InvalidReference(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root.display()
                )));
            }
        }
        Ok(())
    }

    fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
        let (algorithm, hash) = digest.split_once(':').ok_or_else(|| {
            StrataError::InvalidReference(format!("Invalid blob digest: {}", digest))
        })?;
        // Rejects traversal in either component
        safe_file_name(digest)?;
        Ok(root.join("blobs").join(algorithm).join(hash))
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::InvalidReference(format!(
                "Failed to read {} at {}: {}",
                what,
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            StrataError::Serialization(format!("Failed to parse {}: {}", what, e))
        })
    }

    /// Pick the manifest named by `tag`, else the first one.
    fn select_manifest(index: &ImageIndex, tag: Option<&str>) -> Option<String> {
        let manifests = index.manifests();
        let tagged = tag.and_then(|tag| {
            manifests.iter().find(|m| {
                m.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map_or(false, |name| name == tag)
            })
        });
        tagged
            .or_else(|| manifests.first())
            .map(|m| m.digest().to_string())
    }
}

#[async_trait]
impl RegistryClient for LayoutRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<ImageManifestInfo> {
        let root = PathBuf::from(&reference.repository);
        Self::validate(&root)?;

        let index: ImageIndex = Self::read_json(&root.join("index.json"), "index.json")?;
        let mut digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => Self::select_manifest(&index, reference.tag.as_deref()).ok_or_else(|| {
                StrataError::InvalidReference(format!(
                    "No manifests in {}",
                    root.join("index.json").display()
                ))
            })?,
        };

        let manifest_path = Self::blob_path(&root, &digest)?;
        let content = std::fs::read(&manifest_path).map_err(|e| {
            StrataError::InvalidReference(format!(
                "Failed to read manifest at {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        // Nested index: resolve the platform manifest
        let value: serde_json::Value = serde_json::from_slice(&content)?;
        let manifest: ImageManifest = if value.get("manifests").is_some() {
            let nested: ImageIndex = serde_json::from_slice(&content)?;
            digest = linux_platform_manifest(&nested).ok_or_else(|| {
                StrataError::InvalidReference(format!(
                    "{} has no linux/{} manifest",
                    reference,
                    std::env::consts::ARCH
                ))
            })?;
            Self::read_json(&Self::blob_path(&root, &digest)?, "manifest")?
        } else {
            serde_json::from_slice(&content)?
        };

        Ok(ImageManifestInfo::from_oci(&manifest, digest))
    }

    async fn fetch_blob(&self, repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream> {
        let path = Self::blob_path(Path::new(&repo.repository), digest)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::LayerNotFound {
                    digest: digest.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let stream = futures::stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(file)))
                }
                Err(e) => Some((Err(StrataError::Io(e)), None)),
            }
        });
        Ok(stream.boxed())
    }

    fn local_blob_path(&self, repo: &RepositoryRef, digest: &str) -> Option<PathBuf> {
        Self::blob_path(Path::new(&repo.repository), digest)
            .ok()
            .filter(|path| path.is_file())
    }
}
