//! In-flight operation table.
//!
//! The first caller for a key starts the work as a detached task; callers
//! arriving while it runs wait for the same outcome. Dropping a waiter (the
//! first one included) never cancels the work.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::error::{Result, StrataError};
use tokio::sync::watch;

type Outcome = std::result::Result<(), Arc<StrataError>>;
type Slots<K> = Arc<Mutex<HashMap<K, watch::Receiver<Option<Outcome>>>>>;

/// Map from key to the awaitable outcome of the running operation.
pub struct InFlight<K> {
    slots: Slots<K>,
}

/// Removes the slot when the task ends, even by panic.
struct SlotGuard<K: Eq + Hash> {
    slots: Slots<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for SlotGuard<K> {
    fn drop(&mut self) {
        self.slots.lock().remove(&self.key);
    }
}

impl<K> InFlight<K>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of operations currently running.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Run `work` for `key` unless it is already running, then wait for it.
    ///
    /// `work` is dropped unpolled when another caller already started the
    /// operation. Failures reach every waiter as [`StrataError::Shared`].
    pub async fn run<F>(&self, key: K, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut rx = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(rx) => {
                    tracing::trace!(key = %key, "Joining in-flight operation");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), rx.clone());
                    let guard = SlotGuard {
                        slots: self.slots.clone(),
                        key: key.clone(),
                    };
                    tokio::spawn(async move {
                        let _guard = guard;
                        let outcome = work.await.map_err(Arc::new);
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone())
            .ok()
            .flatten();

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(StrataError::Shared(e)),
            None => Err(StrataError::CacheWriteFailed {
                digest: key.to_string(),
                message: "population task aborted".to_string(),
            }),
        }
    }
}

impl<K> Default for InFlight<K>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let table = Arc::new(InFlight::<String>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let runs = runs.clone();
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                table
                    .run("k".to_string(), async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|r| *r).await;
                        Ok(())
                    })
                    .await
            }));
        }

        // Let every caller register before the work finishes
        while !table.contains(&"k".to_string()) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(true).unwrap();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_error_is_shared() {
        let table = InFlight::<String>::new();
        let err = table
            .run("k".to_string(), async {
                Err(StrataError::RegistryUnreachable {
                    registry: "r".to_string(),
                    message: "down".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Shared(_)));
        assert!(err.is_transient());

        // The slot is gone, a new attempt runs again
        table.run("k".to_string(), async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_work_releases_waiters() {
        let table = InFlight::<String>::new();
        let err = table
            .run("k".to_string(), async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::CacheWriteFailed { .. }));
        assert!(err.is_transient());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_work() {
        let table = Arc::new(InFlight::<String>::new());
        let done = Arc::new(AtomicUsize::new(0));

        let work_done = done.clone();
        let first = table.run("k".to_string(), async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            work_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        // Cancel the caller that started the work
        let _ = tokio::time::timeout(Duration::from_millis(1), first).await;

        assert!(table.contains(&"k".to_string()));
        table.run("k".to_string(), async { Ok(()) }).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
