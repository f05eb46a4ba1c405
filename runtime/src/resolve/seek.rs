//! Range reads straight from the origin blob.
//!
//! Used when no disk cache is configured or the cache cannot be written.
//! Decoding starts at the nearest checkpoint at or before the wanted offset,
//! discards output up to it, and stops once the range is captured. The
//! decoding itself runs on the blocking pool.

use std::io::{self, Write};

use flate2::write::MultiGzDecoder;
use strata_core::checkpoint::{Checkpoint, CheckpointTable};
use strata_core::error::{Result, StrataError};

use super::blocking::{consume_blocking, Chunks};
use crate::oci::{RegistryClient, RepositoryRef};

/// Decoder output sink keeping only the wanted window.
struct RangeSink {
    skip: u64,
    window: Vec<u8>,
    filled: usize,
    /// Every byte the decoder produced, skipped ones included
    seen: u64,
}

impl RangeSink {
    fn new(skip: u64, len: usize) -> Self {
        Self {
            skip,
            window: vec![0u8; len],
            filled: 0,
            seen: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.filled == self.window.len()
    }

    /// The captured bytes.
    fn take(&mut self) -> Vec<u8> {
        let mut window = std::mem::take(&mut self.window);
        window.truncate(self.filled);
        window
    }
}

impl Write for RangeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.seen += buf.len() as u64;
        let mut data = buf;
        if self.skip > 0 {
            let n = (self.skip.min(data.len() as u64)) as usize;
            self.skip -= n as u64;
            data = &data[n..];
        }
        let n = (self.window.len() - self.filled).min(data.len());
        self.window[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
        // Accept everything so the decoder keeps going past a full window
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read `dest.len()` bytes at uncompressed `offset` of a layer.
///
/// Returns fewer bytes only when the layer ends first. A checkpoint that does
/// not decode is abandoned for a full decode from the start of the blob.
pub(crate) async fn read_range(
    registry: &dyn RegistryClient,
    repo: &RepositoryRef,
    digest: &str,
    checkpoints: &CheckpointTable,
    offset: u64,
    dest: &mut [u8],
) -> Result<usize> {
    let mut checkpoint = checkpoints.nearest(offset);
    if checkpoint.uncompressed_offset > offset {
        checkpoint = Checkpoint::ORIGIN;
    }

    if checkpoint != Checkpoint::ORIGIN {
        match decode_from(registry, repo, digest, checkpoint, offset, dest).await {
            Err(StrataError::CheckpointInconsistent {
                compressed_offset,
                message,
                ..
            }) => {
                tracing::warn!(
                    digest = %digest,
                    compressed_offset,
                    error = %message,
                    "Checkpoint unusable, decoding from the start of the layer"
                );
            }
            other => return other,
        }
    }
    decode_from(registry, repo, digest, Checkpoint::ORIGIN, offset, dest).await
}

async fn decode_from(
    registry: &dyn RegistryClient,
    repo: &RepositoryRef,
    digest: &str,
    checkpoint: Checkpoint,
    offset: u64,
    dest: &mut [u8],
) -> Result<usize> {
    tracing::debug!(
        digest = %digest,
        offset,
        length = dest.len(),
        compressed_offset = checkpoint.compressed_offset,
        uncompressed_offset = checkpoint.uncompressed_offset,
        "Seek read from origin"
    );

    let stream = registry
        .fetch_blob(repo, digest, checkpoint.compressed_offset)
        .await?;
    let skip = offset - checkpoint.uncompressed_offset;
    let len = dest.len();
    let owned = digest.to_string();
    let window = consume_blocking(stream, move |chunks| {
        decode_window(chunks, &owned, checkpoint, skip, len)
    })
    .await?;

    dest[..window.len()].copy_from_slice(&window);
    Ok(window.len())
}

/// Decode from `checkpoint`, keeping `len` bytes after the first `skip`.
fn decode_window(
    chunks: Chunks,
    digest: &str,
    checkpoint: Checkpoint,
    skip: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(RangeSink::new(skip, len));
    let decode_error = |seen: u64, e: io::Error| {
        if checkpoint.compressed_offset > 0 && seen == 0 {
            StrataError::CheckpointInconsistent {
                digest: digest.to_string(),
                compressed_offset: checkpoint.compressed_offset,
                message: e.to_string(),
            }
        } else {
            StrataError::CorruptLayer {
                digest: digest.to_string(),
                message: e.to_string(),
            }
        }
    };

    for chunk in chunks {
        let chunk = chunk?;
        if let Err(e) = decoder.write_all(&chunk) {
            return Err(decode_error(decoder.get_ref().seen, e));
        }
        if decoder.get_ref().is_full() {
            return Ok(decoder.get_mut().take());
        }
    }

    if let Err(e) = decoder.try_finish() {
        return Err(decode_error(decoder.get_ref().seen, e));
    }
    Ok(decoder.get_mut().take())
}
