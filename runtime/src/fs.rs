//! Filesystem view of an archive.
//!
//! `LazyImage` is the boundary a filesystem protocol server (FUSE,
//! virtio-fs) talks to: path lookups and attributes come from the index,
//! file bytes from the archive's content backend. Attributes never depend on
//! cache state, so an entry whose layer is not cached yet still looks
//! complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_core::archive::{ArchiveMetadata, StorageMode};
use strata_core::error::{Result, StrataError};
use strata_core::index::{file_name, normalize_path};
use strata_core::node::{ContentRef, IndexNode, NodeKind, RemoteRef, Timestamp};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::resolve::{LayerOrigin, Resolver};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// File type as seen by filesystem consumers (hard links are regular files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl FileType {
    fn of(kind: NodeKind) -> Self {
        match kind {
            NodeKind::RegularFile | NodeKind::HardLink => FileType::RegularFile,
            NodeKind::Directory => FileType::Directory,
            NodeKind::Symlink => FileType::Symlink,
        }
    }

    /// `S_IF*` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::RegularFile => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }
}

/// Attributes reported for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    /// 512-byte blocks
    pub blocks: u64,
    pub kind: FileType,
    /// Permission bits plus `S_IF*` type bits
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

/// Where file bytes are read from, fixed by the archive's storage mode.
pub enum ContentBackend {
    /// Lazily from layer blobs through the resolver
    Registry {
        resolver: Arc<Resolver>,
        origin: LayerOrigin,
    },
    /// From the payload section of the archive file
    Embedded { path: PathBuf, payload_offset: u64 },
}

impl ContentBackend {
    /// Backend matching the storage mode of the archive at `path`.
    pub fn for_archive(path: &Path, metadata: &ArchiveMetadata, resolver: Arc<Resolver>) -> Self {
        match metadata.storage_mode {
            StorageMode::Registry => ContentBackend::Registry {
                resolver,
                origin: LayerOrigin::from_metadata(metadata),
            },
            StorageMode::Embedded => ContentBackend::Embedded {
                path: path.to_path_buf(),
                payload_offset: metadata.payload.offset,
            },
        }
    }
}

/// A mounted archive.
pub struct LazyImage {
    metadata: ArchiveMetadata,
    backend: ContentBackend,
}

impl LazyImage {
    /// Open an archive file and pick its content backend.
    pub fn open(path: &Path, resolver: Arc<Resolver>) -> Result<Self> {
        let metadata = ArchiveMetadata::read_from(path)?;
        let backend = ContentBackend::for_archive(path, &metadata, resolver);

        tracing::info!(
            archive = %path.display(),
            storage_mode = ?metadata.storage_mode,
            nodes = metadata.index.len(),
            "Opened archive"
        );
        Ok(Self::new(metadata, backend))
    }

    pub fn new(metadata: ArchiveMetadata, backend: ContentBackend) -> Self {
        Self { metadata, backend }
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn lookup(&self, path: &str) -> Result<&IndexNode> {
        let path = normalize_path(path);
        self.metadata
            .index
            .get(&path)
            .ok_or(StrataError::PathNotFound(path))
    }

    pub fn attr(&self, node: &IndexNode) -> FileAttr {
        let kind = FileType::of(node.kind);
        let size = node.size();
        let nlink = match kind {
            FileType::Directory => node.attr.nlink.max(2),
            _ => node.attr.nlink.max(1),
        };
        FileAttr {
            ino: node.attr.ino,
            size,
            blocks: size.div_ceil(512),
            kind,
            mode: (node.attr.mode & !S_IFMT) | kind.mode_bits(),
            nlink,
            uid: node.attr.uid,
            gid: node.attr.gid,
            atime: node.attr.atime,
            mtime: node.attr.mtime,
            ctime: node.attr.ctime,
        }
    }

    /// Attributes of the node at `path`.
    pub fn getattr(&self, path: &str) -> Result<FileAttr> {
        self.lookup(path).map(|node| self.attr(node))
    }

    /// Children of a directory, sorted by name.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.lookup(path)?;
        if !dir.is_dir() {
            return Err(StrataError::Other(format!("{} is not a directory", dir.path)));
        }
        let mut entries: Vec<DirEntry> = self
            .metadata
            .index
            .children(&dir.path)
            .map(|child| DirEntry {
                name: file_name(&child.path).to_string(),
                ino: child.attr.ino,
                kind: FileType::of(child.kind),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        let node = self.lookup(path)?;
        match (node.kind, &node.link_target) {
            (NodeKind::Symlink, Some(target)) => Ok(target.clone()),
            _ => Err(StrataError::Other(format!("{} is not a symlink", node.path))),
        }
    }

    /// Read up to `length` bytes at `offset` of a file.
    ///
    /// Clamped to the file size; reads at or past the end return nothing.
    pub async fn read(&self, node: &IndexNode, offset: u64, length: u64) -> Result<Vec<u8>> {
        match node.kind {
            NodeKind::RegularFile | NodeKind::HardLink => {}
            NodeKind::Directory => {
                return Err(StrataError::Other(format!("{} is a directory", node.path)))
            }
            NodeKind::Symlink => {
                return Err(StrataError::Other(format!("{} is a symlink", node.path)))
            }
        }

        let size = node.size();
        if offset >= size || length == 0 {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);

        match (&self.backend, &node.content) {
            (ContentBackend::Registry { resolver, origin }, ContentRef::Remote(r)) => {
                let reference = RemoteRef {
                    layer_digest: r.layer_digest.clone(),
                    offset: r.offset + offset,
                    length,
                };
                resolver.read_to_vec(origin, &reference).await
            }
            (
                ContentBackend::Embedded {
                    path,
                    payload_offset,
                },
                ContentRef::Embedded { offset: start, .. },
            ) => read_payload(path, payload_offset + start + offset, length).await,
            _ => Err(StrataError::IndexCorrupt(format!(
                "{} does not match the archive storage mode",
                node.path
            ))),
        }
    }

    /// Read a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let node = self.lookup(path)?;
        self.read(node, 0, node.size()).await
    }
}

async fn read_payload(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        StrataError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open archive {}: {}", path.display(), e),
        ))
    })?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{build_layer, TestEntry};
    use crate::index::{ImageSource, Indexer};
    use crate::resolve::tests::FakeRegistry;
    use strata_core::config::IndexConfig;
    use strata_core::index::FsIndex;
    use strata_core::node::NodeAttr;
    use tempfile::TempDir;

    async fn registry_image(dir: &TempDir) -> (LazyImage, Arc<FakeRegistry>) {
        let mut registry = FakeRegistry::default();
        registry.add(build_layer(&[
            TestEntry::Dir("etc/"),
            TestEntry::File("etc/hostname", b"box\n"),
            TestEntry::File("etc/motd", b"hello, world"),
            TestEntry::Symlink("etc/localtime", "/usr/share/zoneinfo/UTC"),
            TestEntry::HardLink("etc/motd.link", "etc/motd"),
        ]));
        let registry = Arc::new(registry);

        let metadata = Indexer::new(registry.clone(), IndexConfig::default())
            .index(&ImageSource::registry("registry.test/app:1").unwrap())
            .await
            .unwrap();
        let path = dir.path().join("app.strata");
        metadata.write_to(&path).unwrap();

        let resolver = Arc::new(Resolver::new(registry.clone()));
        (LazyImage::open(&path, resolver).unwrap(), registry)
    }

    #[tokio::test]
    async fn test_lookup_and_attr() {
        let dir = TempDir::new().unwrap();
        let (image, registry) = registry_image(&dir).await;
        let indexed = registry.fetches();

        let attr = image.getattr("/etc/hostname").unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 4);
        assert_eq!(attr.mode & S_IFMT, S_IFREG);
        assert!(attr.nlink >= 1);

        let etc = image.getattr("etc").unwrap();
        assert_eq!(etc.mode & S_IFMT, S_IFDIR);
        assert!(etc.nlink >= 2);

        let link = image.getattr("/etc/localtime").unwrap();
        assert_eq!(link.mode & S_IFMT, S_IFLNK);
        assert_eq!(link.size, "/usr/share/zoneinfo/UTC".len() as u64);

        assert!(image.lookup("/missing").unwrap_err().is_not_found());
        // Nothing was fetched to answer metadata queries
        assert_eq!(registry.fetches(), indexed);
    }

    #[tokio::test]
    async fn test_read_dir_and_link() {
        let dir = TempDir::new().unwrap();
        let (image, _) = registry_image(&dir).await;

        let names: Vec<String> = image
            .read_dir("/etc")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["hostname", "localtime", "motd", "motd.link"]);
        assert_eq!(
            image.read_link("/etc/localtime").unwrap(),
            "/usr/share/zoneinfo/UTC"
        );
        assert!(image.read_link("/etc/motd").is_err());
        assert!(image.read_dir("/etc/motd").is_err());
    }

    #[tokio::test]
    async fn test_read_is_clamped() {
        let dir = TempDir::new().unwrap();
        let (image, _) = registry_image(&dir).await;
        let motd = image.lookup("/etc/motd").unwrap();

        assert_eq!(image.read(motd, 0, 5).await.unwrap(), b"hello");
        assert_eq!(image.read(motd, 7, 100).await.unwrap(), b"world");
        assert!(image.read(motd, 12, 10).await.unwrap().is_empty());
        assert!(image.read(motd, 50, 10).await.unwrap().is_empty());

        assert_eq!(image.read_file("/etc/motd.link").await.unwrap(), b"hello, world");
        let etc = image.lookup("/etc").unwrap();
        assert!(image.read(etc, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_embedded_archive() {
        let dir = TempDir::new().unwrap();
        let payload = b"xxembedded bytes".to_vec();

        let mut index = FsIndex::new(ContentRef::Embedded {
            offset: 0,
            length: 0,
        });
        index.insert(IndexNode {
            path: "/note".to_string(),
            kind: NodeKind::RegularFile,
            attr: NodeAttr {
                ino: 42,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 14,
                atime: Timestamp::default(),
                mtime: Timestamp::default(),
                ctime: Timestamp::default(),
                nlink: 1,
            },
            content: ContentRef::Embedded {
                offset: 2,
                length: 14,
            },
            link_target: None,
        });
        let path = dir.path().join("embedded.strata");
        ArchiveMetadata::embedded(index)
            .write_with_payload(&path, &payload)
            .unwrap();

        let resolver = Arc::new(Resolver::new(Arc::new(FakeRegistry::default())));
        let image = LazyImage::open(&path, resolver).unwrap();
        assert!(matches!(image.backend, ContentBackend::Embedded { .. }));
        assert_eq!(image.read_file("/note").await.unwrap(), b"embedded bytes");
        let note = image.lookup("/note").unwrap();
        assert_eq!(image.read(note, 9, 100).await.unwrap(), b"bytes");
    }
}
