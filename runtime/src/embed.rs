//! Self-contained archives.
//!
//! [`create_archive`] packs a directory tree into an embedded archive: the
//! index describes every entry and regular file bytes are laid end to end in
//! the payload section. [`extract_archive`] writes such a tree back out.
//! Both do blocking file I/O.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use strata_core::archive::{ArchiveMetadata, StorageMode};
use strata_core::digest::stable_inode;
use strata_core::error::{Result, StrataError};
use strata_core::index::{normalize_path, FsIndex};
use strata_core::node::{ContentRef, IndexNode, NodeAttr, NodeKind, Timestamp};

/// Salt for inode numbers of embedded entries.
const EMBEDDED_INODE_SALT: &str = "embedded";

/// What went into a new archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hard_links: usize,
    pub payload_bytes: u64,
}

/// What came out of an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hard_links: usize,
    pub bytes: u64,
}

/// Pack the tree under `source` into an embedded archive at `output`.
///
/// Regular files sharing an inode become hard links to the first path seen.
/// Sockets, fifos and device nodes are skipped.
pub fn create_archive(source: &Path, output: &Path) -> Result<CreateSummary> {
    let root_meta = fs::metadata(source).map_err(|e| {
        StrataError::Other(format!("Failed to read {}: {}", source.display(), e))
    })?;
    if !root_meta.is_dir() {
        return Err(StrataError::Other(format!(
            "{} is not a directory",
            source.display()
        )));
    }

    let mut packer = Packer {
        root: source,
        index: FsIndex::new(ContentRef::Embedded {
            offset: 0,
            length: 0,
        }),
        payload: Vec::new(),
        payload_len: 0,
        seen_inodes: HashMap::new(),
        summary: CreateSummary::default(),
    };
    if let Some(root) = packer.index.get_mut("/") {
        let ino = root.attr.ino;
        root.attr = attr_of(&root_meta, ino, 0);
    }
    packer.walk(source)?;

    let Packer {
        mut index,
        payload,
        payload_len,
        mut summary,
        ..
    } = packer;
    index.finalize_link_counts();
    summary.payload_bytes = payload_len;

    let mut reader = PayloadReader::new(payload);
    ArchiveMetadata::embedded(index).write_with_payload_reader(output, payload_len, &mut reader)?;

    tracing::info!(
        source = %source.display(),
        archive = %output.display(),
        files = summary.files,
        directories = summary.directories,
        payload_bytes = payload_len,
        "Created embedded archive"
    );
    Ok(summary)
}

struct Packer<'a> {
    root: &'a Path,
    index: FsIndex,
    /// Files whose bytes make up the payload, in payload order
    payload: Vec<(PathBuf, u64)>,
    payload_len: u64,
    /// (device, inode) of regular files already packed, to their index path
    seen_inodes: HashMap<(u64, u64), String>,
    summary: CreateSummary,
}

impl Packer<'_> {
    fn walk(&mut self, dir: &Path) -> Result<()> {
        let read_dir = fs::read_dir(dir).map_err(|e| {
            StrataError::Other(format!("Failed to read directory {}: {}", dir.display(), e))
        })?;
        let mut entries = read_dir.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let relative = path.strip_prefix(self.root).map_err(|e| {
                StrataError::Other(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let index_path = normalize_path(&relative.to_string_lossy());
            let meta = fs::symlink_metadata(&path)?;
            let ino = stable_inode(EMBEDDED_INODE_SALT, &index_path);
            let file_type = meta.file_type();

            if file_type.is_dir() {
                self.insert(index_path, NodeKind::Directory, attr_of(&meta, ino, 0), empty(), None);
                self.summary.directories += 1;
                self.walk(&path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(&path)?.to_string_lossy().into_owned();
                let attr = attr_of(&meta, ino, target.len() as u64);
                self.insert(index_path, NodeKind::Symlink, attr, empty(), Some(target));
                self.summary.symlinks += 1;
            } else if file_type.is_file() {
                self.add_file(index_path, &path, &meta, ino);
            } else {
                tracing::debug!(path = %path.display(), "Skipping special file");
            }
        }
        Ok(())
    }

    fn add_file(&mut self, index_path: String, path: &Path, meta: &fs::Metadata, ino: u64) {
        let key = (meta.dev(), meta.ino());
        if meta.nlink() > 1 {
            let first = self
                .seen_inodes
                .get(&key)
                .and_then(|first| self.index.get(first))
                .map(|node| (node.path.clone(), node.attr.clone(), node.content.clone()));
            if let Some((target, attr, content)) = first {
                self.insert(index_path, NodeKind::HardLink, attr, content, Some(target));
                self.summary.hard_links += 1;
                return;
            }
            self.seen_inodes.insert(key, index_path.clone());
        }

        let length = meta.len();
        let content = ContentRef::Embedded {
            offset: self.payload_len,
            length,
        };
        self.payload.push((path.to_path_buf(), length));
        self.payload_len += length;
        self.insert(
            index_path,
            NodeKind::RegularFile,
            attr_of(meta, ino, length),
            content,
            None,
        );
        self.summary.files += 1;
    }

    fn insert(
        &mut self,
        path: String,
        kind: NodeKind,
        attr: NodeAttr,
        content: ContentRef,
        link_target: Option<String>,
    ) {
        self.index.insert(IndexNode {
            path,
            kind,
            attr,
            content,
            link_target,
        });
    }
}

fn empty() -> ContentRef {
    ContentRef::Embedded {
        offset: 0,
        length: 0,
    }
}

fn attr_of(meta: &fs::Metadata, ino: u64, size: u64) -> NodeAttr {
    NodeAttr {
        ino,
        mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        size,
        atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        nlink: 1,
    }
}

/// The payload files read back to back.
///
/// Each file contributes exactly the length recorded in the index; a file
/// that shrank since it was indexed is an error.
struct PayloadReader {
    files: std::vec::IntoIter<(PathBuf, u64)>,
    current: Option<(PathBuf, io::Take<File>)>,
}

impl PayloadReader {
    fn new(files: Vec<(PathBuf, u64)>) -> Self {
        Self {
            files: files.into_iter(),
            current: None,
        }
    }
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                let Some((path, length)) = self.files.next() else {
                    return Ok(0);
                };
                let file = File::open(&path)?;
                self.current = Some((path, file.take(length)));
            }
            let Some((path, reader)) = self.current.as_mut() else {
                return Ok(0);
            };

            let n = reader.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if reader.limit() > 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while it was being archived", path.display()),
                ));
            }
            self.current = None;
        }
    }
}

/// Write the tree of the embedded archive at `archive` under `dest`.
///
/// `dest` is created if needed. Directory permissions are applied last so a
/// read-only directory does not block its own contents.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractSummary> {
    let metadata = ArchiveMetadata::read_from(archive)?;
    if metadata.storage_mode != StorageMode::Embedded {
        return Err(StrataError::Other(format!(
            "{} is a {} archive; only embedded archives carry file contents",
            archive.display(),
            metadata.storage_mode
        )));
    }

    fs::create_dir_all(dest)?;
    let mut source = File::open(archive)?;
    let mut summary = ExtractSummary::default();
    let mut directories = Vec::new();
    let mut hard_links = Vec::new();

    for node in metadata.index.iter() {
        let out = dest.join(node.path.trim_start_matches('/'));
        match node.kind {
            NodeKind::Directory => {
                fs::create_dir_all(&out)?;
                directories.push((out, node.attr.mode));
                if node.path != "/" {
                    summary.directories += 1;
                }
            }
            NodeKind::Symlink => {
                let target = node.link_target.as_deref().unwrap_or_default();
                std::os::unix::fs::symlink(target, &out)?;
                summary.symlinks += 1;
            }
            NodeKind::RegularFile => {
                let ContentRef::Embedded { offset, length } = node.content else {
                    return Err(StrataError::IndexCorrupt(format!(
                        "{} has no embedded content",
                        node.path
                    )));
                };
                source.seek(SeekFrom::Start(metadata.payload.offset + offset))?;
                let mut file = File::create(&out)?;
                let copied = io::copy(&mut (&mut source).take(length), &mut file)?;
                if copied != length {
                    return Err(StrataError::IndexCorrupt(format!(
                        "payload of {} is truncated",
                        node.path
                    )));
                }
                file.set_permissions(fs::Permissions::from_mode(node.attr.mode))?;
                file.set_modified(UNIX_EPOCH + to_duration(node.attr.mtime))?;
                summary.files += 1;
                summary.bytes += length;
            }
            NodeKind::HardLink => hard_links.push((out, node)),
        }
    }

    // Link targets may sort after their links
    for (out, node) in hard_links {
        let target = node.link_target.as_deref().unwrap_or_default();
        fs::hard_link(dest.join(target.trim_start_matches('/')), &out)?;
        summary.hard_links += 1;
    }
    for (dir, mode) in directories.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
    }

    tracing::info!(
        archive = %archive.display(),
        dest = %dest.display(),
        files = summary.files,
        bytes = summary.bytes,
        "Extracted embedded archive"
    );
    Ok(summary)
}

fn to_duration(ts: Timestamp) -> Duration {
    Duration::new(ts.secs.max(0) as u64, ts.nanos)
}
