//! Layer indexer.
//!
//! Streams every layer of an image (bottom first), merges the tar entries
//! into one path index and records a checkpoint table per layer. The output
//! is an [`ArchiveMetadata`] in registry mode: no file content is kept.
//!
//! Indexing is all-or-nothing: any failure aborts the run and no archive is
//! produced.

mod counting;
mod layer;
mod overlay;

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use strata_core::archive::{ArchiveMetadata, RegistryCoordinates};
use strata_core::config::{IndexConfig, StrataConfig};
use strata_core::error::{Result, StrataError};
use tokio::io::AsyncWriteExt;

use crate::oci::{
    CredentialChain, ImageReference, LayerDescriptor, LayoutRegistry, RegistryClient,
    RegistryRouter, RepositoryRef,
};

use layer::index_layer;
use overlay::OverlayIndex;

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image in a remote registry
    Registry(ImageReference),
    /// Local OCI image layout directory
    Layout { path: PathBuf, tag: Option<String> },
}

impl ImageSource {
    /// Parse a registry reference such as `nginx:1.25`.
    pub fn registry(reference: &str) -> Result<Self> {
        Ok(Self::Registry(ImageReference::parse(reference)?))
    }

    pub fn layout(path: impl Into<PathBuf>, tag: Option<String>) -> Self {
        Self::Layout {
            path: path.into(),
            tag,
        }
    }

    /// Reference to hand to the registry client.
    pub fn reference(&self) -> Result<ImageReference> {
        match self {
            Self::Registry(reference) => Ok(reference.clone()),
            Self::Layout { path, tag } => LayoutRegistry::reference(path, tag.as_deref()),
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(reference) => write!(f, "{}", reference),
            Self::Layout { path, tag: Some(tag) } => write!(f, "{}:{}", path.display(), tag),
            Self::Layout { path, tag: None } => write!(f, "{}", path.display()),
        }
    }
}

/// Builds archive metadata for images.
pub struct Indexer {
    registry: Arc<dyn RegistryClient>,
    config: IndexConfig,
    credential_hint: Option<String>,
}

impl Indexer {
    pub fn new(registry: Arc<dyn RegistryClient>, config: IndexConfig) -> Self {
        Self {
            registry,
            config,
            credential_hint: None,
        }
    }

    /// Record which credential source should be tried first at mount time.
    pub fn with_credential_hint(mut self, hint: Option<String>) -> Self {
        self.credential_hint = hint;
        self
    }

    /// Index every layer of the image.
    pub async fn index(&self, source: &ImageSource) -> Result<ArchiveMetadata> {
        let reference = source.reference()?;
        let repo = reference.repository_ref();

        tracing::info!(image = %source, "Indexing image");
        let manifest = self.registry.fetch_manifest(&reference).await?;
        let Some(base) = manifest.layers.first() else {
            return Err(StrataError::IndexCorrupt(format!(
                "{} has no layers",
                source
            )));
        };
        for layer in &manifest.layers {
            layer.ensure_supported()?;
        }

        let mut overlay = OverlayIndex::new(&base.digest, self.config.skip_runtime_dirs);
        let mut checkpoints = BTreeMap::new();

        for (position, layer) in manifest.layers.iter().enumerate() {
            let blob = self.open_layer(&repo, layer).await?;
            let digest = layer.digest.clone();
            let config = self.config.clone();

            let (returned, summary) = tokio::task::spawn_blocking(move || {
                let reader = std::io::BufReader::new(blob);
                let summary = index_layer(reader, position, &digest, &mut overlay, &config)?;
                Ok::<_, StrataError>((overlay, summary))
            })
            .await
            .map_err(|e| StrataError::Other(format!("Layer indexing task failed: {}", e)))??;
            overlay = returned;

            tracing::info!(
                digest = %layer.digest,
                position,
                entries = summary.entries,
                checkpoints = summary.checkpoints.len(),
                uncompressed_size = summary.uncompressed_size,
                "Indexed layer"
            );
            checkpoints.insert(layer.digest.clone(), summary.checkpoints);
        }

        let index = overlay.finish();
        let coordinates = RegistryCoordinates {
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            reference: reference.manifest_reference().to_string(),
            manifest_digest: Some(manifest.manifest_digest.clone()),
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            credential_hint: self.credential_hint.clone(),
        };

        tracing::info!(
            image = %source,
            nodes = index.len(),
            layers = coordinates.layers.len(),
            "Indexed image"
        );
        Ok(ArchiveMetadata::registry(index, checkpoints, coordinates))
    }

    /// Open a verified copy of the compressed layer.
    ///
    /// Local blobs are read in place; remote blobs are spooled to an
    /// anonymous temp file while hashing.
    async fn open_layer(&self, repo: &RepositoryRef, layer: &LayerDescriptor) -> Result<std::fs::File> {
        if let Some(path) = self.registry.local_blob_path(repo, &layer.digest) {
            let digest = layer.digest.clone();
            return tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
                let mut file = std::fs::File::open(&path).map_err(|e| {
                    StrataError::LayerNotFound {
                        digest: format!("{} ({}: {})", digest, path.display(), e),
                    }
                })?;
                let mut hasher = Sha256::new();
                std::io::copy(&mut file, &mut hasher)?;
                verify_digest(&digest, hasher)?;
                file.seek(SeekFrom::Start(0))?;
                Ok(file)
            })
            .await
            .map_err(|e| StrataError::Other(format!("Layer verification task failed: {}", e)))?;
        }

        let mut stream = self.registry.fetch_blob(repo, &layer.digest, 0).await?;
        let spool = tempfile::tempfile().map_err(|e| {
            StrataError::Other(format!("Failed to create layer spool file: {}", e))
        })?;
        let mut file = tokio::fs::File::from_std(spool);
        let mut hasher = Sha256::new();
        let mut total = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        verify_digest(&layer.digest, hasher)?;

        tracing::debug!(digest = %layer.digest, bytes = total, "Spooled layer");
        let mut file = file.into_std().await;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }
}

/// Compare a finished hash with a `sha256:` digest.
pub(crate) fn verify_digest(digest: &str, hasher: Sha256) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        tracing::debug!(digest = %digest, "Skipping verification of non-sha256 digest");
        return Ok(());
    };
    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(StrataError::CorruptLayer {
            digest: digest.to_string(),
            message: format!("content hashes to sha256:{}", actual),
        });
    }
    Ok(())
}

/// Index an image with the standard registry clients.
///
/// The credential source that answered for the image's registry is recorded
/// as the archive's credential hint.
pub async fn index_image(
    source: &ImageSource,
    credentials: CredentialChain,
    config: &StrataConfig,
) -> Result<ArchiveMetadata> {
    let hint = match source {
        ImageSource::Registry(reference) => {
            let scope = format!("repository:{}:pull", reference.repository);
            credentials
                .resolve_with_source(&reference.registry, &scope)
                .await
                .map(|(name, _)| name)
        }
        ImageSource::Layout { .. } => None,
    };

    let registry = RegistryRouter::standard(
        Arc::new(credentials),
        config.registry.plain_http.clone(),
    );
    Indexer::new(Arc::new(registry), config.index.clone())
        .with_credential_hint(hint)
        .index(source)
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oci::{BlobStream, ImageManifestInfo};
    use async_trait::async_trait;
    use bytes::Bytes;
    use strata_core::archive::StorageMode;
    use strata_core::digest::sha256_digest;
    use tempfile::TempDir;

    pub(crate) use layer::tests::{build_layer, build_multi_member_layer, decompress, TestEntry};

    /// Member boundaries of a gzip blob, in stream order.
    pub(crate) fn member_boundaries(blob: &[u8]) -> Vec<strata_core::checkpoint::Checkpoint> {
        let boundaries = counting::Boundaries::default();
        let mut decoder = counting::MemberDecoder::new(blob, boundaries.clone());
        std::io::copy(&mut decoder, &mut std::io::sink()).unwrap();
        let recorded = boundaries.lock().clone();
        recorded
    }

    /// Registry serving fixed blobs; `corrupt` blobs are served altered.
    struct StaticRegistry {
        layers: Vec<(LayerDescriptor, Vec<u8>)>,
    }

    impl StaticRegistry {
        fn new(blobs: Vec<(&str, Vec<u8>)>) -> Self {
            let layers = blobs
                .into_iter()
                .map(|(media_type, data)| {
                    (
                        LayerDescriptor {
                            digest: sha256_digest(&data),
                            media_type: media_type.to_string(),
                            size: data.len() as u64,
                        },
                        data,
                    )
                })
                .collect();
            Self { layers }
        }
    }

    #[async_trait]
    impl RegistryClient for StaticRegistry {
        async fn fetch_manifest(&self, _reference: &ImageReference) -> Result<ImageManifestInfo> {
            Ok(ImageManifestInfo {
                manifest_digest: "sha256:manifest".to_string(),
                layers: self.layers.iter().map(|(d, _)| d.clone()).collect(),
            })
        }

        async fn fetch_blob(&self, _repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream> {
            let (_, data) = self
                .layers
                .iter()
                .find(|(d, _)| d.digest == digest)
                .ok_or_else(|| StrataError::LayerNotFound {
                    digest: digest.to_string(),
                })?;
            let chunk = Bytes::copy_from_slice(&data[offset as usize..]);
            Ok(futures::stream::iter(vec![Ok(chunk)]).boxed())
        }
    }

    const GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    fn indexer(registry: StaticRegistry) -> Indexer {
        Indexer::new(Arc::new(registry), IndexConfig::default())
    }

    fn source() -> ImageSource {
        ImageSource::registry("example.com/app:1.0").unwrap()
    }

    #[test]
    fn test_image_source_display() {
        assert_eq!(source().to_string(), "example.com/app:1.0");
        let layout = ImageSource::layout("/images/app", Some("v1".to_string()));
        assert_eq!(layout.to_string(), "/images/app:v1");
    }

    #[tokio::test]
    async fn test_index_registry_image() {
        let base = build_layer(&[
            TestEntry::File("etc/os-release", b"ID=test\n"),
            TestEntry::File("tmp/scratch", b"x"),
        ]);
        let top = build_layer(&[
            TestEntry::File("app/run", b"#!/bin/sh\n"),
            TestEntry::File("tmp/.wh.scratch", b""),
        ]);
        let registry = StaticRegistry::new(vec![(GZIP, base.clone()), (GZIP, top.clone())]);
        let metadata = indexer(registry)
            .with_credential_hint(Some("env".to_string()))
            .index(&source())
            .await
            .unwrap();

        assert_eq!(metadata.storage_mode, StorageMode::Registry);
        assert_eq!(metadata.coordinates.registry, "example.com");
        assert_eq!(metadata.coordinates.repository, "app");
        assert_eq!(metadata.coordinates.reference, "1.0");
        assert_eq!(
            metadata.coordinates.layers,
            vec![sha256_digest(&base), sha256_digest(&top)]
        );
        assert_eq!(metadata.coordinates.credential_hint.as_deref(), Some("env"));
        assert_eq!(metadata.checkpoints.len(), 2);

        let index = &metadata.index;
        assert!(index.contains("/etc/os-release"));
        assert!(index.contains("/app/run"));
        assert!(index.contains("/tmp"));
        assert!(!index.contains("/tmp/scratch"));
        assert!(!index.contains("/tmp/.wh.scratch"));

        // Archive round trip keeps everything
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.strata");
        metadata.write_to(&path).unwrap();
        assert_eq!(ArchiveMetadata::read_from(&path).unwrap().index, metadata.index);
    }

    #[tokio::test]
    async fn test_index_rejects_empty_image() {
        let result = indexer(StaticRegistry::new(Vec::new())).index(&source()).await;
        assert!(matches!(result, Err(StrataError::IndexCorrupt(_))));
    }

    #[tokio::test]
    async fn test_index_rejects_zstd() {
        let layer = build_layer(&[TestEntry::File("a", b"a")]);
        let registry = StaticRegistry::new(vec![(
            "application/vnd.oci.image.layer.v1.tar+zstd",
            layer,
        )]);
        let result = indexer(registry).index(&source()).await;
        assert!(matches!(result, Err(StrataError::UnsupportedMediaType(_))));
    }

    #[tokio::test]
    async fn test_index_detects_digest_mismatch() {
        let layer = build_layer(&[TestEntry::File("a", b"a")]);
        let mut registry = StaticRegistry::new(vec![(GZIP, layer)]);
        registry.layers[0].0.digest = format!("sha256:{}", "0".repeat(64));
        let result = indexer(registry).index(&source()).await;
        assert!(matches!(result, Err(StrataError::CorruptLayer { .. })));
    }

    #[tokio::test]
    async fn test_index_layout() {
        let dir = TempDir::new().unwrap();
        let layer = build_layer(&[TestEntry::File("hello.txt", b"hello")]);
        crate::oci::layout::tests::create_layout(dir.path(), &[("v1", vec![layer])]);

        let registry = Arc::new(RegistryRouter::standard(
            Arc::new(crate::oci::Anonymous),
            Vec::new(),
        ));
        let source = ImageSource::layout(dir.path(), Some("v1".to_string()));
        let metadata = Indexer::new(registry, IndexConfig::default())
            .index(&source)
            .await
            .unwrap();

        assert_eq!(metadata.coordinates.registry, "oci-layout");
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            metadata.coordinates.repository,
            canonical.to_string_lossy()
        );
        assert_eq!(metadata.index.get("/hello.txt").unwrap().size(), 5);
    }

    #[test]
    fn test_verify_digest() {
        let mut hasher = Sha256::new();
        hasher.update(b"abc");
        let digest = sha256_digest(b"abc");
        assert!(verify_digest(&digest, hasher.clone()).is_ok());
        assert!(verify_digest("sha512:whatever", hasher.clone()).is_ok());
        assert!(matches!(
            verify_digest(&sha256_digest(b"abd"), hasher),
            Err(StrataError::CorruptLayer { .. })
        ));
    }
}
