//! Byte counting around the layer decompressor.
//!
//! Gzip cannot be resumed at an arbitrary compressed offset: the deflate
//! window at that point is unknown. It can be resumed at a member boundary,
//! where a fresh decoder starts with an empty window. `MemberDecoder` walks
//! the members of a (possibly multi-member) gzip stream and reports every
//! boundary as a (compressed, uncompressed) pair that is a valid resume
//! point.

use std::io::{self, BufRead, Read};
use std::sync::Arc;

use flate2::bufread::GzDecoder;
use parking_lot::Mutex;
use strata_core::checkpoint::Checkpoint;

/// Boundaries discovered so far, shared with the entry loop.
pub(crate) type Boundaries = Arc<Mutex<Vec<Checkpoint>>>;

/// `BufRead` wrapper counting consumed (compressed) bytes.
pub(crate) struct CountingBufReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: BufRead> CountingBufReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<R: BufRead> Read for CountingBufReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingBufReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.consumed += amt as u64;
    }
}

/// Multi-member gzip decoder that records member boundaries.
pub(crate) struct MemberDecoder<R> {
    /// `None` once the stream is exhausted
    decoder: Option<GzDecoder<CountingBufReader<R>>>,
    produced: u64,
    boundaries: Boundaries,
}

impl<R: BufRead> MemberDecoder<R> {
    pub(crate) fn new(reader: R, boundaries: Boundaries) -> Self {
        Self {
            decoder: Some(GzDecoder::new(CountingBufReader::new(reader))),
            produced: 0,
            boundaries,
        }
    }

    /// Uncompressed bytes produced so far.
    pub(crate) fn produced(&self) -> u64 {
        self.produced
    }
}

impl<R: BufRead> Read for MemberDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(0);
            };
            let n = decoder.read(buf)?;
            if n > 0 {
                self.produced += n as u64;
                return Ok(n);
            }

            // Member finished; the reader sits on the next member's header
            let Some(decoder) = self.decoder.take() else {
                return Ok(0);
            };
            let mut reader = decoder.into_inner();
            self.boundaries
                .lock()
                .push(Checkpoint::new(reader.consumed(), self.produced));

            if reader.fill_buf()?.is_empty() {
                return Ok(0);
            }
            self.decoder = Some(GzDecoder::new(reader));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_counting_reader() {
        let data = b"hello world".to_vec();
        let mut reader = CountingBufReader::new(io::BufReader::new(&data[..]));
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.consumed(), 5);
        reader.fill_buf().unwrap();
        reader.consume(3);
        assert_eq!(reader.consumed(), 8);
    }

    #[test]
    fn test_single_member() {
        let compressed = gzip(b"abcdef");
        let boundaries = Boundaries::default();
        let mut decoder = MemberDecoder::new(&compressed[..], boundaries.clone());

        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(decoder.produced(), 6);
        assert_eq!(
            *boundaries.lock(),
            vec![Checkpoint::new(compressed.len() as u64, 6)]
        );
    }

    #[test]
    fn test_member_boundaries_are_resume_points() {
        let first = gzip(b"first member ");
        let second = gzip(b"second member");
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let boundaries = Boundaries::default();
        let mut decoder = MemberDecoder::new(&stream[..], boundaries.clone());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"first member second member");

        let recorded = boundaries.lock().clone();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], Checkpoint::new(first.len() as u64, 13));
        assert_eq!(recorded[1], Checkpoint::new(stream.len() as u64, 26));

        // Resuming at the first boundary yields the rest of the stream
        let resumed = &stream[recorded[0].compressed_offset as usize..];
        let mut tail = Vec::new();
        MemberDecoder::new(resumed, Boundaries::default())
            .read_to_end(&mut tail)
            .unwrap();
        assert_eq!(tail, b"second member");
    }

    #[test]
    fn test_trailing_garbage_is_an_error() {
        let mut stream = gzip(b"data");
        stream.extend_from_slice(b"not gzip");
        let mut out = Vec::new();
        let result = MemberDecoder::new(&stream[..], Boundaries::default()).read_to_end(&mut out);
        assert!(result.is_err());
    }
}
