//! Index node model.

use serde::{Deserialize, Serialize};

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    HardLink,
}

impl NodeKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::RegularFile => "file",
            NodeKind::Directory => "dir",
            NodeKind::Symlink => "symlink",
            NodeKind::HardLink => "hardlink",
        };
        write!(f, "{}", s)
    }
}

/// Timestamp with sub-second precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Parse a PAX decimal time value such as `1700000000.123456789`.
    pub fn from_pax(value: &str) -> Option<Self> {
        let value = value.trim();
        let (negative, value) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (whole, frac) = match value.split_once('.') {
            Some((w, f)) => (w, f),
            None => (value, ""),
        };

        let secs: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };

        let mut nanos: u32 = 0;
        if !frac.is_empty() {
            if !frac.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let digits: String = frac.chars().take(9).collect();
            let padded = format!("{:0<9}", digits);
            nanos = padded.parse().ok()?;
        }

        if negative {
            // -1.5 means 1.5 seconds before the epoch
            if nanos > 0 {
                Some(Self::new(-secs - 1, 1_000_000_000 - nanos))
            } else {
                Some(Self::new(-secs, 0))
            }
        } else {
            Some(Self::new(secs, nanos))
        }
    }
}

/// File attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Inode number (stable across mounts of the same archive)
    pub ino: u64,
    /// Permission bits (no file type bits)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Content size in bytes
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Link count; never 0 once the index is finalized
    pub nlink: u32,
}

/// Where a node's bytes live: in the archive itself, or inside a layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentRef {
    /// Byte range within the archive's payload section
    Embedded { offset: u64, length: u64 },
    /// Byte range within a layer's decompressed tar stream
    Remote(RemoteRef),
}

impl ContentRef {
    pub fn length(&self) -> u64 {
        match self {
            ContentRef::Embedded { length, .. } => *length,
            ContentRef::Remote(r) => r.length,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, ContentRef::Embedded { .. })
    }

    pub fn as_remote(&self) -> Option<&RemoteRef> {
        match self {
            ContentRef::Remote(r) => Some(r),
            ContentRef::Embedded { .. } => None,
        }
    }
}

/// Location of a node's bytes inside a decompressed layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub layer_digest: String,
    /// Absolute offset within the decompressed layer
    pub offset: u64,
    pub length: u64,
}

/// One entry per filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexNode {
    pub path: String,
    pub kind: NodeKind,
    pub attr: NodeAttr,
    pub content: ContentRef,
    /// Set only for symlinks and hard links
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl IndexNode {
    /// Size reported to filesystem consumers.
    ///
    /// Derived from the content reference, or the target length for symlinks.
    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::Symlink => self
                .link_target
                .as_ref()
                .map(|t| t.len() as u64)
                .unwrap_or(0),
            NodeKind::Directory => 0,
            NodeKind::RegularFile | NodeKind::HardLink => self.content.length(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Digest of the layer that introduced this node, if it is layer-backed.
    pub fn layer_digest(&self) -> Option<&str> {
        self.content.as_remote().map(|r| r.layer_digest.as_str())
    }
}
