//! Lazy content resolution.
//!
//! Turns a `RemoteRef` (layer digest + range in the decompressed layer) into
//! bytes, trying the cheapest tier first:
//!
//! ```text
//! read(ref)
//!   │
//!   ├─ disk cache hit ───────────────► bytes
//!   ├─ remote cache full answer ─────► bytes
//!   └─ miss
//!        ├─ disk cache configured
//!        │    └─ populate layer (deduplicated per digest)
//!        │         fetch blob ─► decompress ─► verify ─► commit
//!        │         └─ push to remote cache (background)
//!        │       then read from disk ─────► bytes
//!        └─ otherwise
//!             seek read from nearest checkpoint ─► bytes
//! ```

mod blocking;
mod inflight;
mod seek;

pub use inflight::InFlight;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use strata_core::archive::ArchiveMetadata;
use strata_core::checkpoint::CheckpointTable;
use strata_core::config::StrataConfig;
use strata_core::digest::digest_hex;
use strata_core::error::{Result, StrataError};
use strata_core::node::RemoteRef;
use tokio::task::JoinHandle;

use crate::cache::{CacheWriter, ContentCache, DiskCache, HttpContentCache};
use blocking::{consume_blocking, Chunks};
use crate::index::verify_digest;
use crate::oci::{CredentialChain, RegistryClient, RegistryRouter, RepositoryRef};

/// Where an archive's layers come from, with their checkpoint tables.
#[derive(Debug, Clone)]
pub struct LayerOrigin {
    repo: RepositoryRef,
    layers: Vec<String>,
    checkpoints: BTreeMap<String, CheckpointTable>,
}

impl LayerOrigin {
    pub fn new(
        repo: RepositoryRef,
        layers: Vec<String>,
        checkpoints: BTreeMap<String, CheckpointTable>,
    ) -> Self {
        Self {
            repo,
            layers,
            checkpoints,
        }
    }

    pub fn from_metadata(metadata: &ArchiveMetadata) -> Self {
        let coords = &metadata.coordinates;
        Self {
            repo: RepositoryRef::new(&coords.registry, &coords.repository),
            layers: coords.layers.clone(),
            checkpoints: metadata.checkpoints.clone(),
        }
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repo
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn contains_layer(&self, digest: &str) -> bool {
        self.layers.iter().any(|l| l == digest)
    }

    /// Checkpoints of a layer; empty (decode from the start) when none were recorded.
    pub fn checkpoints(&self, digest: &str) -> CheckpointTable {
        self.checkpoints.get(digest).cloned().unwrap_or_default()
    }
}

/// Resolves layer content through the cache tiers.
///
/// Safe to share between tasks; all reads of one layer share a single
/// population.
pub struct Resolver {
    registry: Arc<dyn RegistryClient>,
    disk: Option<Arc<DiskCache>>,
    remote: Option<Arc<dyn ContentCache>>,
    push_to_remote: bool,
    max_disk_bytes: Option<u64>,
    inflight: InFlight<String>,
    /// Background remote cache uploads. Handles are detached tasks, so
    /// dropping the resolver never cancels an upload.
    pushes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Resolver {
    /// Resolver without caches: every read is a seek read from the origin.
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            disk: None,
            remote: None,
            push_to_remote: true,
            max_disk_bytes: None,
            inflight: InFlight::new(),
            pushes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_disk_cache(mut self, disk: Arc<DiskCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn with_remote_cache(mut self, remote: Arc<dyn ContentCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Whether freshly populated layers are stored in the remote cache.
    pub fn with_push_to_remote(mut self, push: bool) -> Self {
        self.push_to_remote = push;
        self
    }

    /// Prune the disk cache to this size after each population.
    pub fn with_max_disk_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_disk_bytes = max_bytes;
        self
    }

    /// Build a resolver with the standard registry clients and the
    /// configured caches.
    pub fn from_config(config: &StrataConfig, credentials: CredentialChain) -> Result<Self> {
        let registry = RegistryRouter::standard(
            Arc::new(credentials),
            config.registry.plain_http.clone(),
        );
        let mut resolver = Self::new(Arc::new(registry))
            .with_push_to_remote(config.cache.push_to_remote)
            .with_max_disk_bytes(config.cache.max_disk_bytes);

        if let Some(dir) = &config.cache.disk_dir {
            resolver = resolver.with_disk_cache(Arc::new(DiskCache::new(dir)?));
        }
        if let Some(url) = &config.cache.remote_url {
            resolver = resolver.with_remote_cache(Arc::new(HttpContentCache::new(url.clone())));
        }

        tracing::debug!(
            disk_cache = ?config.cache.disk_dir,
            remote_cache = ?config.cache.remote_url,
            "Resolver configured"
        );
        Ok(resolver)
    }

    pub fn disk_cache(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }

    /// Read the referenced range into `dest`.
    ///
    /// Reads `min(reference.length, dest.len())` bytes; fewer only when the
    /// layer ends first.
    pub async fn read(
        &self,
        origin: &LayerOrigin,
        reference: &RemoteRef,
        dest: &mut [u8],
    ) -> Result<usize> {
        let len = (reference.length.min(dest.len() as u64)) as usize;
        let dest = &mut dest[..len];
        let digest = reference.layer_digest.as_str();
        let offset = reference.offset;

        if !origin.contains_layer(digest) {
            return Err(StrataError::LayerNotFound {
                digest: digest.to_string(),
            });
        }
        if len == 0 {
            return Ok(0);
        }

        if let Some(disk) = &self.disk {
            match disk.read_at(digest, offset, dest).await {
                Ok(Some(n)) => {
                    tracing::trace!(digest = %digest, offset, length = n, "Disk cache hit");
                    return Ok(n);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Disk cache read failed");
                }
            }
        }

        if let Some(remote) = &self.remote {
            match remote.get_range(digest_hex(digest), offset, len as u64).await {
                Ok(Some(bytes)) if bytes.len() == len => {
                    tracing::trace!(digest = %digest, offset, length = len, "Remote cache hit");
                    dest.copy_from_slice(&bytes);
                    return Ok(len);
                }
                Ok(Some(bytes)) => {
                    tracing::debug!(
                        digest = %digest,
                        wanted = len,
                        got = bytes.len(),
                        "Remote cache returned a short range"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Remote cache read failed");
                }
            }
        }

        let Some(disk) = self.disk.clone() else {
            return self.seek_read(origin, digest, offset, dest).await;
        };

        match self.populate(origin, digest, disk.clone()).await {
            Ok(()) => {}
            Err(e) if is_cache_write_failure(&e) => {
                tracing::warn!(
                    digest = %digest,
                    error = %e,
                    "Disk cache unavailable, reading from origin"
                );
                return self.seek_read(origin, digest, offset, dest).await;
            }
            Err(e) => return Err(e),
        }

        match disk.read_at(digest, offset, dest).await {
            Ok(Some(n)) => Ok(n),
            Ok(None) => {
                tracing::debug!(digest = %digest, "Populated layer already evicted");
                self.seek_read(origin, digest, offset, dest).await
            }
            Err(e) => {
                tracing::warn!(digest = %digest, error = %e, "Disk cache read failed");
                self.seek_read(origin, digest, offset, dest).await
            }
        }
    }

    /// Read the referenced range into a new buffer.
    pub async fn read_to_vec(&self, origin: &LayerOrigin, reference: &RemoteRef) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; reference.length as usize];
        let n = self.read(origin, reference, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Make sure a layer is fully present in the disk cache.
    pub async fn prefetch(&self, origin: &LayerOrigin, digest: &str) -> Result<()> {
        if !origin.contains_layer(digest) {
            return Err(StrataError::LayerNotFound {
                digest: digest.to_string(),
            });
        }
        let Some(disk) = self.disk.clone() else {
            return Err(StrataError::Config(
                "prefetch requires a disk cache".to_string(),
            ));
        };
        self.populate(origin, digest, disk).await
    }

    /// Number of layer populations currently running.
    pub fn populations_in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Remote cache uploads started and not yet reaped.
    pub fn pending_pushes(&self) -> usize {
        self.pushes.lock().len()
    }

    /// Wait for background remote cache uploads started so far.
    pub async fn wait_for_pushes(&self) {
        let pushes = std::mem::take(&mut *self.pushes.lock());
        for push in pushes {
            if let Err(e) = push.await {
                tracing::warn!(error = %e, "Remote cache upload task failed");
            }
        }
    }

    async fn seek_read(
        &self,
        origin: &LayerOrigin,
        digest: &str,
        offset: u64,
        dest: &mut [u8],
    ) -> Result<usize> {
        let checkpoints = origin.checkpoints(digest);
        seek::read_range(
            self.registry.as_ref(),
            origin.repository(),
            digest,
            &checkpoints,
            offset,
            dest,
        )
        .await
    }

    async fn populate(&self, origin: &LayerOrigin, digest: &str, disk: Arc<DiskCache>) -> Result<()> {
        let remote = if self.push_to_remote {
            self.remote.clone()
        } else {
            None
        };
        let job = Population {
            registry: self.registry.clone(),
            disk,
            remote,
            pushes: self.pushes.clone(),
            repo: origin.repository().clone(),
            digest: digest.to_string(),
            max_disk_bytes: self.max_disk_bytes,
        };
        self.inflight.run(digest.to_string(), job.run()).await
    }
}

/// One layer's trip from the origin into the disk cache.
struct Population {
    registry: Arc<dyn RegistryClient>,
    disk: Arc<DiskCache>,
    remote: Option<Arc<dyn ContentCache>>,
    pushes: Arc<Mutex<Vec<JoinHandle<()>>>>,
    repo: RepositoryRef,
    digest: String,
    max_disk_bytes: Option<u64>,
}

impl Population {
    async fn run(self) -> Result<()> {
        let digest = self.digest.as_str();
        if self.disk.contains(digest) {
            return Ok(());
        }
        tracing::info!(repository = %self.repo, digest = %digest, "Populating layer cache");

        let writer = self.disk.begin_write(digest)?;
        let stream = self.registry.fetch_blob(&self.repo, digest, 0).await?;
        let owned = self.digest.clone();
        let (compressed, size) =
            consume_blocking(stream, move |chunks| inflate_to_cache(chunks, writer, &owned)).await?;
        tracing::info!(
            digest = %digest,
            compressed_bytes = compressed,
            size_bytes = size,
            "Layer cached"
        );

        if let Some(remote) = self.remote.clone() {
            self.push(remote)?;
        }

        if let Some(max) = self.max_disk_bytes {
            let disk = self.disk.clone();
            let keep = self.digest.clone();
            let pruned = tokio::task::spawn_blocking(move || disk.prune(max, Some(keep.as_str())))
                .await
                .map_err(|e| StrataError::Other(format!("Cache prune task failed: {}", e)))
                .and_then(|result| result);
            match pruned {
                Ok(0) => {}
                Ok(evicted) => tracing::info!(evicted, max_bytes = max, "Pruned layer cache"),
                Err(e) => tracing::warn!(error = %e, "Failed to prune layer cache"),
            }
        }
        Ok(())
    }

    /// Upload the committed entry to the remote cache in the background.
    fn push(&self, remote: Arc<dyn ContentCache>) -> Result<()> {
        let path = self.disk.entry_path(&self.digest)?;
        let digest = self.digest.clone();
        let handle = tokio::spawn(async move {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Failed to read layer for upload");
                    return;
                }
            };
            match remote.store(digest_hex(&digest), Bytes::from(data)).await {
                Ok(()) => tracing::debug!(digest = %digest, "Stored layer in remote cache"),
                Err(e) => tracing::warn!(digest = %digest, error = %e, "Remote cache upload failed"),
            }
        });

        let mut pushes = self.pushes.lock();
        pushes.retain(|push| !push.is_finished());
        pushes.push(handle);
        Ok(())
    }
}

/// Inflate a layer blob into a cache entry, verify it and publish it.
///
/// Runs on the blocking pool. Returns the compressed and decompressed sizes.
fn inflate_to_cache(chunks: Chunks, writer: CacheWriter, digest: &str) -> Result<(u64, u64)> {
    let mut decoder = flate2::write::MultiGzDecoder::new(writer);
    let mut hasher = Sha256::new();
    let mut compressed = 0u64;

    for chunk in chunks {
        let chunk = chunk?;
        hasher.update(&chunk);
        compressed += chunk.len() as u64;
        if let Err(e) = decoder.write_all(&chunk) {
            return Err(write_error(digest, decoder.get_ref(), e));
        }
    }
    if let Err(e) = decoder.try_finish() {
        return Err(write_error(digest, decoder.get_ref(), e));
    }
    verify_digest(digest, hasher)?;

    let writer = decoder
        .finish()
        .map_err(|e| StrataError::CorruptLayer {
            digest: digest.to_string(),
            message: e.to_string(),
        })?;
    let size = writer.commit()?;
    Ok((compressed, size))
}

/// Tell a cache write failure apart from a decode failure.
fn write_error(digest: &str, writer: &CacheWriter, e: std::io::Error) -> StrataError {
    match writer.failure() {
        Some(failure) => StrataError::CacheWriteFailed {
            digest: digest.to_string(),
            message: failure.to_string(),
        },
        None => StrataError::CorruptLayer {
            digest: digest.to_string(),
            message: e.to_string(),
        },
    }
}

fn is_cache_write_failure(err: &StrataError) -> bool {
    match err {
        StrataError::CacheWriteFailed { .. } => true,
        StrataError::Shared(inner) => is_cache_write_failure(inner),
        _ => false,
    }
}
