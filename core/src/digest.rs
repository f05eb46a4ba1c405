//! Digest helpers.
//!
//! Layer digests arrive as `<algorithm>:<hex>` strings from manifests and
//! end up as cache keys and file names, so they are validated once here.

use sha2::{Digest, Sha256};

use crate::error::{Result, StrataError};

/// Inode number reserved for the root directory.
pub const ROOT_INODE: u64 = 1;

/// Return the hex part of a digest (`sha256:abc` -> `abc`).
///
/// Remote content cache keys use this form so identical layer content maps
/// to the same key regardless of which image or archive refers to it.
pub fn digest_hex(digest: &str) -> &str {
    match digest.split_once(':') {
        Some((_, hex)) => hex,
        None => digest,
    }
}

/// Validate a digest and turn it into a filesystem-safe name (`sha256_abc`).
pub fn safe_file_name(digest: &str) -> Result<String> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
        StrataError::Other(format!("Malformed digest (missing algorithm): {}", digest))
    })?;

    let valid_part = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '_' || c == '.')
    };

    if !valid_part(algorithm) || !valid_part(hex) || hex.contains("..") {
        return Err(StrataError::Other(format!("Malformed digest: {}", digest)));
    }

    Ok(format!("{}_{}", algorithm, hex))
}

/// Compute the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Derive a stable inode number for a path introduced by a layer.
///
/// First 8 bytes of SHA-256(layer digest ‖ path), never 0 and never the
/// root inode.
pub fn stable_inode(layer_digest: &str, path: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(layer_digest.as_bytes());
    hasher.update(path.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    let ino = u64::from_be_bytes(bytes);

    if ino <= ROOT_INODE {
        ino + 2
    } else {
        ino
    }
}
