//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use strata_core::error::{Result, StrataError};
use strata_runtime::oci::{
    BlobStream, ImageManifestInfo, ImageReference, LayerDescriptor, RegistryClient, RepositoryRef,
};

pub const GZIP_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Entry of a test layer.
pub enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
}

fn append(builder: &mut tar::Builder<Vec<u8>>, entry: &Entry<'_>) {
    let mut header = tar::Header::new_gnu();
    header.set_mtime(1_700_000_000);
    header.set_uid(0);
    header.set_gid(0);
    match entry {
        Entry::File(path, data) => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        Entry::Dir(path) => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, path, std::io::empty()).unwrap();
        }
        Entry::Symlink(path, target) => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, path, target).unwrap();
        }
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Build a gzip tar layer with one gzip member per group of entries.
pub fn layer(groups: &[&[Entry<'_>]]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut cuts = Vec::new();
    for group in groups {
        for entry in group.iter() {
            append(&mut builder, entry);
        }
        cuts.push(builder.get_ref().len());
    }
    let tar = builder.into_inner().unwrap();

    let mut blob = Vec::new();
    let mut start = 0;
    for (i, cut) in cuts.iter().enumerate() {
        // The end-of-archive blocks belong to the last member
        let end = if i + 1 == cuts.len() { tar.len() } else { *cut };
        blob.extend_from_slice(&gzip(&tar[start..end]));
        start = end;
    }
    blob
}

pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Deterministic, poorly compressible bytes.
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

/// In-memory registry: images by repository, blobs by digest.
#[derive(Default)]
pub struct TestRegistry {
    images: HashMap<String, Vec<String>>,
    blobs: HashMap<String, Vec<u8>>,
    blob_fetches: Mutex<HashMap<String, usize>>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
    down: AtomicBool,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every blob fetch, so concurrent readers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Register an image under `repository`, returning its layer digests.
    pub fn image(&mut self, repository: &str, layers: Vec<Vec<u8>>) -> Vec<String> {
        let mut digests = Vec::new();
        for blob in layers {
            let digest = digest_of(&blob);
            self.blobs.insert(digest.clone(), blob);
            digests.push(digest);
        }
        self.images.insert(repository.to_string(), digests.clone());
        digests
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetches_of(&self, digest: &str) -> usize {
        self.blob_fetches.lock().get(digest).copied().unwrap_or(0)
    }

    pub fn blob(&self, digest: &str) -> &[u8] {
        &self.blobs[digest]
    }

    /// Make every blob fetch fail as if the registry were unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryClient for TestRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<ImageManifestInfo> {
        let digests = self
            .images
            .get(&reference.repository)
            .ok_or_else(|| StrataError::InvalidReference(reference.full_reference()))?;
        let layers = digests
            .iter()
            .map(|digest| LayerDescriptor {
                digest: digest.clone(),
                media_type: GZIP_LAYER.to_string(),
                size: self.blobs[digest].len() as u64,
            })
            .collect();
        Ok(ImageManifestInfo {
            manifest_digest: format!("sha256:{}", "0".repeat(64)),
            layers,
        })
    }

    async fn fetch_blob(&self, repo: &RepositoryRef, digest: &str, offset: u64) -> Result<BlobStream> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StrataError::RegistryUnreachable {
                registry: repo.registry.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self
            .blob_fetches
            .lock()
            .entry(digest.to_string())
            .or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let blob = self.blobs.get(digest).ok_or_else(|| StrataError::LayerNotFound {
            digest: digest.to_string(),
        })?;
        let start = (offset as usize).min(blob.len());
        let chunks: Vec<Result<Bytes>> = blob[start..]
            .chunks(16 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Lay out an OCI image directory holding one tagged image.
pub fn write_layout(root: &Path, tag: &str, layers: &[Vec<u8>]) {
    let blobs = root.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs).unwrap();
    let put = |data: &[u8]| -> (String, usize) {
        let digest = digest_of(data);
        std::fs::write(blobs.join(&digest["sha256:".len()..]), data).unwrap();
        (digest, data.len())
    };

    let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
    let (config_digest, config_size) = put(config);
    let layer_descriptors: Vec<serde_json::Value> = layers
        .iter()
        .map(|layer| {
            let (digest, size) = put(layer);
            serde_json::json!({ "mediaType": GZIP_LAYER, "digest": digest, "size": size })
        })
        .collect();
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_size
        },
        "layers": layer_descriptors
    });
    let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
    let (manifest_digest, manifest_size) = put(&manifest_bytes);

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_size,
            "annotations": { "org.opencontainers.image.ref.name": tag }
        }]
    });
    std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    std::fs::write(root.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
}
