//! Hand a blob stream to a synchronous consumer on the blocking pool.
//!
//! Inflating a layer and writing it to disk is CPU and file I/O bound, so it
//! runs under `spawn_blocking`; the async side only forwards chunks.

use bytes::Bytes;
use futures::StreamExt;
use strata_core::error::{Result, StrataError};
use tokio::sync::mpsc;

use crate::oci::BlobStream;

/// Chunks buffered between the network and the consumer.
const CHUNK_QUEUE: usize = 16;

/// Blob chunks as seen from the blocking side, in stream order.
///
/// A stream error is delivered as an item; the iterator ends when the
/// stream does.
pub(crate) struct Chunks {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl Iterator for Chunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}

/// Run `consume` on the blocking pool, feeding it `stream`.
///
/// Forwarding stops after a stream error or once `consume` returns, so a
/// consumer may finish early (a filled range) without draining the blob.
pub(crate) async fn consume_blocking<T, F>(mut stream: BlobStream, consume: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Chunks) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
    let task = tokio::task::spawn_blocking(move || consume(Chunks { rx }));

    while let Some(chunk) = stream.next().await {
        let failed = chunk.is_err();
        if tx.send(chunk).await.is_err() || failed {
            break;
        }
    }
    drop(tx);

    task.await
        .map_err(|e| StrataError::Other(format!("Blocking decode task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn stream_of(items: Vec<Result<Bytes>>) -> BlobStream {
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_consumer_sees_every_chunk() {
        let stream = stream_of(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
            Ok(Bytes::from_static(b"e")),
        ]);
        let joined = consume_blocking(stream, |chunks| {
            let mut out = Vec::new();
            for chunk in chunks {
                out.extend_from_slice(&chunk?);
            }
            Ok(out)
        })
        .await
        .unwrap();
        assert_eq!(joined, b"abcde");
    }

    #[tokio::test]
    async fn test_stream_error_reaches_consumer() {
        let stream = stream_of(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(StrataError::RegistryUnreachable {
                registry: "r".to_string(),
                message: "reset".to_string(),
            }),
            Ok(Bytes::from_static(b"never")),
        ]);
        let err = consume_blocking(stream, |chunks| {
            for chunk in chunks {
                chunk?;
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StrataError::RegistryUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_early_return_stops_forwarding() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let stream = futures::stream::iter(0..1000)
            .map(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from_static(b"x"))
            })
            .boxed();

        let first = consume_blocking(stream, |mut chunks| {
            chunks.next().transpose().map(|c| c.map(|b| b.len()))
        })
        .await
        .unwrap();
        assert_eq!(first, Some(1));
        assert!(pulled.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_runtime_thread_stays_free() {
        // A consumer that blocks does not stall other tasks on a
        // single-threaded runtime
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let stream = stream_of(vec![Ok(Bytes::from_static(b"x"))]);
        let slow = tokio::spawn(consume_blocking(stream, move |chunks| {
            let _ = release_rx.recv();
            Ok(chunks.count())
        }));

        let other = tokio::spawn(async { 7 });
        assert_eq!(other.await.unwrap(), 7);
        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), 1);
    }
}
