//! Content-addressed disk cache for decompressed layers.
//!
//! Each layer is stored as a single file named by its digest, so a layer
//! shared by several images (or several archives) is stored once. Metadata
//! lives alongside as `<name>.meta.json`.

use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_core::digest::safe_file_name;
use strata_core::error::{Result, StrataError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Minimum number of seconds between two persisted `last_accessed` updates.
const TOUCH_INTERVAL_SECS: i64 = 60;

const TEMP_PREFIX: &str = ".strata-";
const META_SUFFIX: &str = ".meta.json";

/// Metadata for a cached layer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Layer digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Size of the decompressed layer in bytes
    pub size_bytes: u64,
    /// When this layer was cached (Unix timestamp)
    pub cached_at: i64,
    /// Last time this layer was read (Unix timestamp)
    pub last_accessed: i64,
}

/// Disk cache of fully decompressed layers.
pub struct DiskCache {
    /// Root directory (e.g. ~/.strata/cache/layers)
    cache_dir: PathBuf,
    /// When each entry's access time was last persisted
    touched: DashMap<String, i64>,
}

impl DiskCache {
    /// Open (and create if needed) a disk cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            StrataError::Config(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            touched: DashMap::new(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of the entry file for a digest.
    pub fn entry_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.cache_dir.join(safe_file_name(digest)?))
    }

    fn meta_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self
            .cache_dir
            .join(format!("{}{}", safe_file_name(digest)?, META_SUFFIX)))
    }

    /// Whether a complete entry exists for the digest.
    pub fn contains(&self, digest: &str) -> bool {
        self.entry_path(digest)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Read up to `dest.len()` bytes at `offset` from the cached layer.
    ///
    /// Returns `None` when the layer is not cached. Short reads happen only
    /// at the end of the layer.
    pub async fn read_at(&self, digest: &str, offset: u64, dest: &mut [u8]) -> Result<Option<usize>> {
        let path = self.entry_path(digest)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < dest.len() {
            let n = file.read(&mut dest[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.touch(digest);
        Ok(Some(filled))
    }

    /// Start writing a new entry. Nothing is visible until [`CacheWriter::commit`].
    pub fn begin_write(&self, digest: &str) -> Result<CacheWriter> {
        let final_path = self.entry_path(digest)?;
        let meta_path = self.meta_path(digest)?;
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.cache_dir)
            .map_err(|e| StrataError::CacheWriteFailed {
                digest: digest.to_string(),
                message: format!("Failed to create temp file: {}", e),
            })?;

        Ok(CacheWriter {
            digest: digest.to_string(),
            file,
            final_path,
            meta_path,
            written: 0,
            failure: None,
        })
    }

    /// Record an access, persisting it at most once a minute per entry.
    pub fn touch(&self, digest: &str) {
        let now = chrono::Utc::now().timestamp();
        if let Some(last) = self.touched.get(digest) {
            if now - *last < TOUCH_INTERVAL_SECS {
                return;
            }
        }
        self.touched.insert(digest.to_string(), now);

        let Ok(meta_path) = self.meta_path(digest) else {
            return;
        };
        if let Ok(content) = std::fs::read_to_string(&meta_path) {
            if let Ok(mut meta) = serde_json::from_str::<LayerMeta>(&content) {
                meta.last_accessed = now;
                if let Err(e) = write_meta(&self.cache_dir, &meta_path, &meta) {
                    tracing::debug!(digest = %digest, error = %e, "Failed to update access time");
                }
            }
        }
    }

    /// Remove a cached layer by digest.
    pub fn invalidate(&self, digest: &str) -> Result<()> {
        let entry_path = self.entry_path(digest)?;
        let meta_path = self.meta_path(digest)?;

        for path in [&entry_path, &meta_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StrataError::Other(format!(
                        "Failed to remove cache file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        self.touched.remove(digest);
        Ok(())
    }

    /// Prune the cache to stay within the given byte limit.
    ///
    /// Evicts least-recently-accessed entries first, never the one named by
    /// `keep`. Returns the number of entries evicted.
    pub fn prune(&self, max_bytes: u64, keep: Option<&str>) -> Result<usize> {
        let mut entries = self.list_entries()?;

        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total_size <= max_bytes {
            return Ok(0);
        }

        // Oldest first
        entries.sort_by_key(|e| e.last_accessed);

        let mut current_size = total_size;
        let mut evicted = 0;

        for entry in &entries {
            if current_size <= max_bytes {
                break;
            }
            if Some(entry.digest.as_str()) == keep {
                continue;
            }
            self.invalidate(&entry.digest)?;
            current_size = current_size.saturating_sub(entry.size_bytes);
            evicted += 1;

            tracing::debug!(
                digest = %entry.digest,
                size_bytes = entry.size_bytes,
                "Evicted cached layer"
            );
        }

        Ok(evicted)
    }

    /// List all cached layer entries with their metadata.
    ///
    /// An entry file whose metadata is missing or unreadable is listed with
    /// its on-disk size and an access time of zero, so pruning evicts it
    /// first. Metadata without an entry file is ignored.
    pub fn list_entries(&self) -> Result<Vec<LayerMeta>> {
        let mut entries = Vec::new();

        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            StrataError::Other(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) || name.ends_with(META_SUFFIX) {
                continue;
            }
            let Some((algorithm, hex)) = name.split_once('_') else {
                continue;
            };
            let digest = format!("{}:{}", algorithm, hex);
            let Ok(meta_path) = self.meta_path(&digest) else {
                continue;
            };

            let meta = std::fs::read_to_string(&meta_path)
                .ok()
                .and_then(|content| serde_json::from_str::<LayerMeta>(&content).ok());
            match meta {
                Some(meta) => entries.push(meta),
                None => {
                    tracing::debug!(digest = %digest, "Cached layer has no metadata");
                    entries.push(LayerMeta {
                        digest,
                        size_bytes: entry.metadata()?.len(),
                        cached_at: 0,
                        last_accessed: 0,
                    });
                }
            }
        }

        Ok(entries)
    }

    /// Get the total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }
}

/// Pending disk cache entry.
///
/// Write errors are remembered so a caller driving a decoder into this
/// writer can tell a cache failure apart from a decode failure.
pub struct CacheWriter {
    digest: String,
    file: tempfile::NamedTempFile,
    final_path: PathBuf,
    meta_path: PathBuf,
    written: u64,
    failure: Option<String>,
}

impl CacheWriter {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// The first write error, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Atomically publish the entry and its metadata.
    ///
    /// Blocks on fsync; async callers run it on the blocking pool. The
    /// metadata lands first, so a published entry always has it.
    pub fn commit(mut self) -> Result<u64> {
        let fail = |message: String| StrataError::CacheWriteFailed {
            digest: self.digest.clone(),
            message,
        };

        if let Some(failure) = self.failure.clone() {
            return Err(fail(failure));
        }
        self.file
            .as_file_mut()
            .sync_all()
            .map_err(|e| fail(format!("sync failed: {}", e)))?;

        let cache_dir = self
            .final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let now = chrono::Utc::now().timestamp();
        let meta = LayerMeta {
            digest: self.digest.clone(),
            size_bytes: self.written,
            cached_at: now,
            last_accessed: now,
        };
        write_meta(&cache_dir, &self.meta_path, &meta)
            .map_err(|e| fail(format!("metadata write failed: {}", e)))?;

        if let Err(e) = self.file.persist(&self.final_path) {
            let _ = std::fs::remove_file(&self.meta_path);
            return Err(fail(format!("rename failed: {}", e.error)));
        }

        tracing::debug!(
            digest = %self.digest,
            size_bytes = self.written,
            path = %self.final_path.display(),
            "Cached decompressed layer"
        );
        Ok(self.written)
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.write(buf) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(e) => {
                if self.failure.is_none() {
                    self.failure = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn write_meta(dir: &Path, path: &Path, meta: &LayerMeta) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(meta)?;
    let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    tmp.write_all(&data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
