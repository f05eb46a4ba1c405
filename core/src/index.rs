//! Path index: the complete filesystem view of an image.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::digest::ROOT_INODE;
use crate::node::{ContentRef, IndexNode, NodeAttr, NodeKind, Timestamp};

/// Normalize a tar entry name into an absolute path.
///
/// Strips leading `./` and `/`, resolves `.` and `..` lexically without
/// escaping the root, and drops trailing slashes.
pub fn normalize_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut path = String::with_capacity(raw.len() + 1);
    for part in parts {
        path.push('/');
        path.push_str(part);
    }
    path
}

/// Parent of a normalized path (`/` for top-level entries and the root).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a normalized path (empty for the root).
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Ordered map from normalized path to index node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FsIndex {
    nodes: BTreeMap<String, IndexNode>,
}

impl FsIndex {
    /// Create an index holding only the root directory.
    pub fn new(root_content: ContentRef) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            IndexNode {
                path: "/".to_string(),
                kind: NodeKind::Directory,
                attr: NodeAttr {
                    ino: ROOT_INODE,
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    atime: Timestamp::default(),
                    mtime: Timestamp::default(),
                    ctime: Timestamp::default(),
                    nlink: 2,
                },
                content: root_content,
                link_target: None,
            },
        );
        Self { nodes }
    }

    pub fn get(&self, path: &str) -> Option<&IndexNode> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut IndexNode> {
        self.nodes.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Insert or replace the node at `node.path`.
    pub fn insert(&mut self, node: IndexNode) -> Option<IndexNode> {
        self.nodes.insert(node.path.clone(), node)
    }

    pub fn remove(&mut self, path: &str) -> Option<IndexNode> {
        self.nodes.remove(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in path order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexNode> {
        self.nodes.values()
    }

    /// Iterate `(key, node)` pairs in path order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &IndexNode)> {
        self.nodes.iter()
    }

    /// Immediate children of `dir`, in path order.
    pub fn children<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a IndexNode> + 'a {
        let prefix = child_prefix(normalize_dir(dir));
        let len = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .filter(move |(path, _)| {
                let rest = &path[len..];
                !rest.is_empty() && !rest.contains('/')
            })
            .map(|(_, node)| node)
    }

    /// All paths strictly below `dir`.
    pub fn descendants(&self, dir: &str) -> Vec<String> {
        let prefix = child_prefix(normalize_dir(dir));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| path.as_str() != "/")
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Remove every path strictly below `dir`, returning how many were removed.
    pub fn remove_descendants(&mut self, dir: &str) -> usize {
        let doomed = self.descendants(dir);
        for path in &doomed {
            self.nodes.remove(path);
        }
        doomed.len()
    }

    /// Recompute link counts once the overlay is complete.
    ///
    /// Directories get `2 + immediate subdirectories`; every other node gets
    /// the number of nodes sharing its inode.
    pub fn finalize_link_counts(&mut self) {
        let mut subdirs: HashMap<String, u32> = HashMap::new();
        let mut inode_refs: HashMap<u64, u32> = HashMap::new();

        for node in self.nodes.values() {
            if node.is_dir() {
                if node.path != "/" {
                    *subdirs.entry(parent_path(&node.path).to_string()).or_insert(0) += 1;
                }
            } else {
                *inode_refs.entry(node.attr.ino).or_insert(0) += 1;
            }
        }

        for node in self.nodes.values_mut() {
            node.attr.nlink = if node.is_dir() {
                2 + subdirs.get(&node.path).copied().unwrap_or(0)
            } else {
                inode_refs.get(&node.attr.ino).copied().unwrap_or(1).max(1)
            };
        }
    }

    /// Count nodes per kind.
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

fn normalize_dir(dir: &str) -> &str {
    if dir.len() > 1 {
        dir.trim_end_matches('/')
    } else {
        dir
    }
}
