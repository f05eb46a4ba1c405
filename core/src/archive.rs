//! Archive file format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! +---------------------------+ 0
//! | magic "\x89STRATA\n"      |
//! | version (u8)              |
//! | storage mode (u8)         |
//! | reserved (6 bytes)        |
//! | index length (u64)        |
//! | checkpoints length (u64)  |
//! | coordinates length (u64)  |
//! | payload length (u64)      |
//! +---------------------------+ 48
//! | index (JSON)              |
//! | checkpoint tables (JSON)  |
//! | registry coordinates      |
//! | payload (embedded only)   |
//! +---------------------------+
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointTable;
use crate::error::{Result, StrataError};
use crate::index::FsIndex;
use crate::node::ContentRef;

/// Archive magic bytes.
pub const ARCHIVE_MAGIC: [u8; 8] = *b"\x89STRATA\n";

/// Current archive format version.
pub const ARCHIVE_VERSION: u8 = 1;

/// Size of the fixed header.
pub const HEADER_LEN: u64 = 48;

/// Where node content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// File bytes live in the archive's payload section
    Embedded,
    /// File bytes are fetched lazily from the layer blobs
    Registry,
}

impl StorageMode {
    fn to_byte(self) -> u8 {
        match self {
            StorageMode::Embedded => 0,
            StorageMode::Registry => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(StorageMode::Embedded),
            1 => Ok(StorageMode::Registry),
            other => Err(StrataError::IndexCorrupt(format!(
                "unknown storage mode {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Embedded => write!(f, "embedded"),
            StorageMode::Registry => write!(f, "registry"),
        }
    }
}

/// Where the image's layers can be fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCoordinates {
    /// Registry host (`oci-layout` for local layouts)
    pub registry: String,
    /// Repository path (absolute layout path for local layouts)
    pub repository: String,
    /// Tag or digest the image was indexed from
    pub reference: String,
    /// Resolved manifest digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    /// Layer digests, bottom layer first
    pub layers: Vec<String>,
    /// Name of the credential source to try first when mounting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_hint: Option<String>,
}

impl RegistryCoordinates {
    pub fn contains_layer(&self, digest: &str) -> bool {
        self.layers.iter().any(|l| l == digest)
    }
}

/// Location of the payload section inside an archive file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadSection {
    pub offset: u64,
    pub length: u64,
}

/// Persisted archive: index, checkpoint tables and registry coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub version: u8,
    pub storage_mode: StorageMode,
    pub index: FsIndex,
    /// Checkpoint table per layer digest
    pub checkpoints: BTreeMap<String, CheckpointTable>,
    pub coordinates: RegistryCoordinates,
    /// Payload location, populated by [`ArchiveMetadata::read_from`]
    pub payload: PayloadSection,
}

impl ArchiveMetadata {
    /// Metadata for a lazily loaded, registry-backed image.
    pub fn registry(
        index: FsIndex,
        checkpoints: BTreeMap<String, CheckpointTable>,
        coordinates: RegistryCoordinates,
    ) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            storage_mode: StorageMode::Registry,
            index,
            checkpoints,
            coordinates,
            payload: PayloadSection::default(),
        }
    }

    /// Metadata for a self-contained archive whose bytes live in the payload.
    pub fn embedded(index: FsIndex) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            storage_mode: StorageMode::Embedded,
            index,
            checkpoints: BTreeMap::new(),
            coordinates: RegistryCoordinates::default(),
            payload: PayloadSection::default(),
        }
    }

    /// Write a registry-mode archive (no payload).
    pub fn write_to(&self, path: &Path) -> Result<()> {
        self.write_with_payload(path, &[])
    }

    /// Write the archive with an in-memory payload section.
    pub fn write_with_payload(&self, path: &Path, payload: &[u8]) -> Result<()> {
        self.write_with_payload_reader(path, payload.len() as u64, &mut &payload[..])
    }

    /// Write the archive, streaming `payload_len` payload bytes from `payload`.
    ///
    /// The file appears atomically: it is written to a temporary file in the
    /// same directory and renamed into place. A payload that ends early
    /// leaves nothing behind.
    pub fn write_with_payload_reader<R: Read>(
        &self,
        path: &Path,
        payload_len: u64,
        payload: &mut R,
    ) -> Result<()> {
        self.check_consistency(payload_len)?;

        let index = serde_json::to_vec(&self.index)?;
        let checkpoints = serde_json::to_vec(&self.checkpoints)?;
        let coordinates = serde_json::to_vec(&self.coordinates)?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&ARCHIVE_MAGIC);
        header.push(self.version);
        header.push(self.storage_mode.to_byte());
        header.extend_from_slice(&[0u8; 6]);
        for len in [index.len() as u64, checkpoints.len() as u64, coordinates.len() as u64, payload_len] {
            header.extend_from_slice(&len.to_le_bytes());
        }

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let file = tmp.as_file_mut();
            file.write_all(&header)?;
            file.write_all(&index)?;
            file.write_all(&checkpoints)?;
            file.write_all(&coordinates)?;
            let copied = std::io::copy(&mut payload.take(payload_len), file)?;
            if copied != payload_len {
                return Err(StrataError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("payload ended after {} of {} bytes", copied, payload_len),
                )));
            }
            file.sync_all()?;
        }
        tmp.persist(path).map_err(|e| StrataError::Io(e.error))?;

        tracing::debug!(
            path = %path.display(),
            nodes = self.index.len(),
            layers = self.coordinates.layers.len(),
            payload_bytes = payload_len,
            "Wrote archive"
        );
        Ok(())
    }

    /// Read and validate an archive file.
    pub fn read_from(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let file_len = file.metadata()?.len();

        if file_len < HEADER_LEN {
            return Err(StrataError::IndexCorrupt(format!(
                "{} is too short for an archive header",
                path.display()
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;

        if header[..8] != ARCHIVE_MAGIC {
            return Err(StrataError::IndexCorrupt(format!(
                "{} is not a strata archive (bad magic)",
                path.display()
            )));
        }
        let version = header[8];
        if version != ARCHIVE_VERSION {
            return Err(StrataError::IndexCorrupt(format!(
                "unsupported archive version {}",
                version
            )));
        }
        let storage_mode = StorageMode::from_byte(header[9])?;

        let mut lengths = [0u64; 4];
        for (i, len) in lengths.iter_mut().enumerate() {
            let start = 16 + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&header[start..start + 8]);
            *len = u64::from_le_bytes(buf);
        }
        let [index_len, checkpoints_len, coordinates_len, payload_len] = lengths;

        let total = lengths
            .iter()
            .try_fold(HEADER_LEN, |acc, l| acc.checked_add(*l))
            .ok_or_else(|| StrataError::IndexCorrupt("section lengths overflow".to_string()))?;
        if total != file_len {
            return Err(StrataError::IndexCorrupt(format!(
                "section lengths add up to {} bytes but file has {}",
                total, file_len
            )));
        }

        let index: FsIndex = read_section(&mut file, index_len, "index")?;
        let checkpoints: BTreeMap<String, CheckpointTable> =
            read_section(&mut file, checkpoints_len, "checkpoints")?;
        let coordinates: RegistryCoordinates =
            read_section(&mut file, coordinates_len, "coordinates")?;

        let payload_offset = file.stream_position()?;

        let metadata = Self {
            version,
            storage_mode,
            index,
            checkpoints,
            coordinates,
            payload: PayloadSection {
                offset: payload_offset,
                length: payload_len,
            },
        };
        metadata.check_consistency(payload_len)?;
        Ok(metadata)
    }

    /// Cross-section invariants shared by the reader and the writer.
    fn check_consistency(&self, payload_len: u64) -> Result<()> {
        if self.index.get("/").is_none() {
            return Err(StrataError::IndexCorrupt("index has no root".to_string()));
        }

        for (key, node) in self.index.entries() {
            if *key != node.path {
                return Err(StrataError::IndexCorrupt(format!(
                    "index key {} does not match node path {}",
                    key, node.path
                )));
            }
            match (&node.content, self.storage_mode) {
                (ContentRef::Embedded { .. }, StorageMode::Registry) => {
                    return Err(StrataError::IndexCorrupt(format!(
                        "registry archive has embedded node {}",
                        node.path
                    )));
                }
                (ContentRef::Embedded { offset, length }, StorageMode::Embedded) => {
                    let end = offset.checked_add(*length).unwrap_or(u64::MAX);
                    if end > payload_len {
                        return Err(StrataError::IndexCorrupt(format!(
                            "node {} points past the payload section",
                            node.path
                        )));
                    }
                }
                (ContentRef::Remote(r), StorageMode::Registry) => {
                    if !self.coordinates.contains_layer(&r.layer_digest) {
                        return Err(StrataError::IndexCorrupt(format!(
                            "node {} references unknown layer {}",
                            node.path, r.layer_digest
                        )));
                    }
                }
                (ContentRef::Remote(_), StorageMode::Embedded) => {
                    return Err(StrataError::IndexCorrupt(format!(
                        "embedded archive has remote node {}",
                        node.path
                    )));
                }
            }
        }

        for (digest, table) in &self.checkpoints {
            table.validate().map_err(|e| {
                StrataError::IndexCorrupt(format!("layer {}: {}", digest, e))
            })?;
        }
        Ok(())
    }

    /// Checkpoint table for a layer (empty when none was recorded).
    pub fn checkpoints_for(&self, digest: &str) -> CheckpointTable {
        self.checkpoints.get(digest).cloned().unwrap_or_default()
    }
}

fn read_section<T, R>(reader: &mut R, len: u64, name: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    R: Read,
{
    let mut buf = Vec::with_capacity(len as usize);
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(StrataError::IndexCorrupt(format!(
            "{} section truncated",
            name
        )));
    }
    serde_json::from_slice(&buf)
        .map_err(|e| StrataError::IndexCorrupt(format!("{} section: {}", name, e)))
}
