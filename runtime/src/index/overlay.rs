//! Overlay merge of layer entries into a single path index.
//!
//! Layers are applied bottom first. A later entry replaces an earlier one at
//! the same path; whiteout markers delete paths from lower layers.

use std::collections::{HashMap, HashSet};

use strata_core::digest::stable_inode;
use strata_core::error::{Result, StrataError};
use strata_core::index::{file_name, normalize_path, parent_path, FsIndex};
use strata_core::node::{ContentRef, IndexNode, NodeAttr, NodeKind, RemoteRef, Timestamp};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";
/// AUFS metadata (`.wh..wh.plnk`, `.wh..wh.aufs`, ...)
const META_PREFIX: &str = ".wh..wh.";

/// Mounted by the container runtime, never taken from the image.
const RUNTIME_DIRS: &[&str] = &["/proc", "/sys", "/dev"];

/// One parsed tar entry, ready to be merged.
#[derive(Debug, Clone)]
pub(crate) struct LayerEntry {
    /// Normalized absolute path
    pub path: String,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Offset of the entry's data in the decompressed layer
    pub offset: u64,
    pub size: u64,
    /// Symlink target as written, or normalized hard link target
    pub link_target: Option<String>,
}

/// Running index plus the layer each path came from.
pub(crate) struct OverlayIndex {
    index: FsIndex,
    origins: HashMap<String, usize>,
    skip_runtime_dirs: bool,
}

impl OverlayIndex {
    /// Start with a bare root whose content points at the bottom layer.
    pub(crate) fn new(base_layer: &str, skip_runtime_dirs: bool) -> Self {
        let root = ContentRef::Remote(RemoteRef {
            layer_digest: base_layer.to_string(),
            offset: 0,
            length: 0,
        });
        Self {
            index: FsIndex::new(root),
            origins: HashMap::new(),
            skip_runtime_dirs,
        }
    }

    pub(crate) fn index(&self) -> &FsIndex {
        &self.index
    }

    /// Merge one entry of layer `layer` (0 = bottom) with digest `digest`.
    pub(crate) fn apply(&mut self, layer: usize, digest: &str, entry: LayerEntry) -> Result<()> {
        if self.skip_runtime_dirs && is_runtime_path(&entry.path) {
            return Ok(());
        }

        if entry
            .path
            .split('/')
            .any(|c| c.starts_with(META_PREFIX) && c != OPAQUE_MARKER)
        {
            tracing::trace!(path = %entry.path, "Ignoring whiteout metadata entry");
            return Ok(());
        }

        let name = file_name(&entry.path);
        if name.starts_with(WHITEOUT_PREFIX) {
            return self.apply_whiteout(layer, digest, &entry);
        }

        if entry.path == "/" {
            if let Some(root) = self.index.get_mut("/") {
                root.attr.mode = entry.mode;
                root.attr.uid = entry.uid;
                root.attr.gid = entry.gid;
                root.attr.atime = entry.atime;
                root.attr.mtime = entry.mtime;
                root.attr.ctime = entry.ctime;
            }
            return Ok(());
        }

        let node = match self.build_node(digest, &entry) {
            Some(node) => node,
            None => return Ok(()),
        };

        self.ensure_parents(layer, digest, &entry);

        if let Some(existing) = self.index.get(&entry.path) {
            if existing.is_dir() && !node.is_dir() {
                // A file over a directory hides everything below it
                let removed = self.remove_subtree(&entry.path);
                tracing::trace!(path = %entry.path, removed, "Directory replaced by non-directory");
            }
        }

        self.origins.insert(entry.path.clone(), layer);
        self.index.insert(node);
        Ok(())
    }

    fn build_node(&self, digest: &str, entry: &LayerEntry) -> Option<IndexNode> {
        let mut attr = NodeAttr {
            ino: stable_inode(digest, &entry.path),
            mode: entry.mode & 0o7777,
            uid: entry.uid,
            gid: entry.gid,
            size: 0,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
            nlink: if entry.kind.is_dir() { 2 } else { 1 },
        };
        let remote = |length: u64| {
            ContentRef::Remote(RemoteRef {
                layer_digest: digest.to_string(),
                offset: entry.offset,
                length,
            })
        };

        let node = match entry.kind {
            NodeKind::RegularFile => {
                attr.size = entry.size;
                IndexNode {
                    path: entry.path.clone(),
                    kind: NodeKind::RegularFile,
                    attr,
                    content: remote(entry.size),
                    link_target: None,
                }
            }
            NodeKind::Directory => IndexNode {
                path: entry.path.clone(),
                kind: NodeKind::Directory,
                attr,
                content: remote(0),
                link_target: None,
            },
            NodeKind::Symlink => {
                let target = entry.link_target.clone().unwrap_or_default();
                attr.size = target.len() as u64;
                IndexNode {
                    path: entry.path.clone(),
                    kind: NodeKind::Symlink,
                    attr,
                    content: remote(0),
                    link_target: Some(target),
                }
            }
            NodeKind::HardLink => {
                let target_path = entry.link_target.as_deref().map(normalize_path)?;
                let Some(target) = self.index.get(&target_path).filter(|t| !t.is_dir()) else {
                    tracing::warn!(
                        path = %entry.path,
                        target = %target_path,
                        "Skipping hard link to missing target"
                    );
                    return None;
                };
                // A link to a symlink is the same symlink under a second name
                let (kind, link_target) = match target.kind {
                    NodeKind::Symlink => (NodeKind::Symlink, target.link_target.clone()),
                    _ => (NodeKind::HardLink, Some(target_path)),
                };
                IndexNode {
                    path: entry.path.clone(),
                    kind,
                    attr: target.attr.clone(),
                    content: target.content.clone(),
                    link_target,
                }
            }
        };
        Some(node)
    }

    fn apply_whiteout(&mut self, layer: usize, digest: &str, entry: &LayerEntry) -> Result<()> {
        let name = file_name(&entry.path);
        let dir = parent_path(&entry.path).to_string();

        if name == OPAQUE_MARKER {
            self.ensure_parents(layer, digest, entry);
            let removed = self.remove_lower(&dir, layer);
            tracing::debug!(dir = %dir, removed, "Applied opaque whiteout");
            return Ok(());
        }
        let victim = &name[WHITEOUT_PREFIX.len()..];
        if victim.is_empty() || victim == "." || victim == ".." {
            return Err(StrataError::WhiteoutViolation {
                path: entry.path.clone(),
                message: format!("invalid whiteout target {:?}", victim),
            });
        }
        let victim_path = normalize_path(&format!("{}/{}", dir, victim));
        if victim_path == "/" {
            return Err(StrataError::WhiteoutViolation {
                path: entry.path.clone(),
                message: "whiteout of the root directory".to_string(),
            });
        }

        if self.index.remove(&victim_path).is_some() {
            self.origins.remove(&victim_path);
            let below = self.remove_subtree(&victim_path);
            tracing::trace!(path = %victim_path, below, "Applied whiteout");
        }
        Ok(())
    }

    /// Remove everything strictly below `dir`.
    fn remove_subtree(&mut self, dir: &str) -> usize {
        let doomed = self.index.descendants(dir);
        for path in &doomed {
            self.index.remove(path);
            self.origins.remove(path);
        }
        doomed.len()
    }

    /// Remove paths below `dir` introduced by layers below `layer`.
    ///
    /// Lower directories still holding entries of this layer stay, so the
    /// parent chain of every surviving node is intact.
    fn remove_lower(&mut self, dir: &str, layer: usize) -> usize {
        let below = self.index.descendants(dir);
        let is_lower = |path: &String| self.origins.get(path).map_or(true, |l| *l < layer);

        let mut keep: HashSet<String> = HashSet::new();
        for path in below.iter().filter(|p| !is_lower(*p)) {
            let mut ancestor = parent_path(path);
            while ancestor.len() > dir.len() {
                keep.insert(ancestor.to_string());
                ancestor = parent_path(ancestor);
            }
        }

        let doomed: Vec<String> = below
            .into_iter()
            .filter(|p| is_lower(p) && !keep.contains(p))
            .collect();
        for path in &doomed {
            self.index.remove(path);
            self.origins.remove(path);
        }
        doomed.len()
    }

    /// Synthesize missing parent directories of `entry.path`.
    fn ensure_parents(&mut self, layer: usize, digest: &str, entry: &LayerEntry) {
        let mut missing = Vec::new();
        let mut dir = parent_path(&entry.path);
        while dir != "/" {
            match self.index.get(dir) {
                Some(node) if node.is_dir() => break,
                Some(_) => {
                    tracing::debug!(path = %dir, "Replacing non-directory with implicit directory");
                    missing.push(dir.to_string());
                }
                None => missing.push(dir.to_string()),
            }
            dir = parent_path(dir);
        }

        for path in missing.into_iter().rev() {
            let node = IndexNode {
                path: path.clone(),
                kind: NodeKind::Directory,
                attr: NodeAttr {
                    ino: stable_inode(digest, &path),
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    atime: entry.atime,
                    mtime: entry.mtime,
                    ctime: entry.ctime,
                    nlink: 2,
                },
                content: ContentRef::Remote(RemoteRef {
                    layer_digest: digest.to_string(),
                    offset: entry.offset,
                    length: 0,
                }),
                link_target: None,
            };
            self.origins.insert(path, layer);
            self.index.insert(node);
        }
    }

    /// Finalize link counts and hand out the index.
    pub(crate) fn finish(mut self) -> FsIndex {
        self.index.finalize_link_counts();
        self.index
    }
}

fn is_runtime_path(path: &str) -> bool {
    RUNTIME_DIRS.iter().any(|dir| {
        path == *dir
            || path
                .strip_prefix(dir)
                .map_or(false, |rest| rest.starts_with('/'))
    })
}
