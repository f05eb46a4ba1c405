//! Remote content cache clients.
//!
//! A remote cache is a network-accessible content-addressed store shared by
//! many hosts. Keys are pure hex digests so the same layer content maps to
//! the same key across images and archives.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use strata_core::error::{Result, StrataError};

/// Range-readable content-addressed store.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Read `length` bytes at `offset` of the object stored under `key`.
    ///
    /// Returns `None` when the object is absent.
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Bytes>>;

    /// Store a complete object under `key`.
    async fn store(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Remote cache speaking plain HTTP: `GET`/`PUT <base>/<key>` with range requests.
pub struct HttpContentCache {
    base_url: String,
    client: reqwest::Client,
}

impl HttpContentCache {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn unreachable(&self, message: impl std::fmt::Display) -> StrataError {
        StrataError::RegistryUnreachable {
            registry: self.base_url.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ContentCache for HttpContentCache {
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Bytes>> {
        if length == 0 {
            return Ok(Some(Bytes::new()));
        }
        let end = offset + length - 1;
        let response = self
            .client
            .get(self.object_url(key))
            .header(reqwest::header::RANGE, format!("bytes={}-{}", offset, end))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE
        {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(self.unreachable(format!("GET {} returned {}", key, status)));
        }

        let full_object = status == reqwest::StatusCode::OK;
        let body = response.bytes().await.map_err(|e| self.unreachable(e))?;
        if full_object {
            // Server ignored the range
            let start = (offset as usize).min(body.len());
            let stop = (start + length as usize).min(body.len());
            return Ok(Some(body.slice(start..stop)));
        }
        Ok(Some(body))
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        let response = self
            .client
            .put(self.object_url(key))
            .body(data)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if !response.status().is_success() {
            return Err(self.unreachable(format!(
                "PUT {} returned {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-process content cache.
#[derive(Default)]
pub struct MemoryContentCache {
    objects: DashMap<String, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl MemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of `store` calls received.
    pub fn stores(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentCache for MemoryContentCache {
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Bytes>> {
        let Some(object) = self.objects.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        self.hits.fetch_add(1, Ordering::Relaxed);

        let len = object.len() as u64;
        let start = offset.min(len) as usize;
        let stop = offset.saturating_add(length).min(len) as usize;
        Ok(Some(object.slice(start..stop)))
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(key.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_miss() {
        let cache = MemoryContentCache::new();
        assert!(cache.get_range("abc", 0, 4).await.unwrap().is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[tokio::test]
    async fn test_memory_cache_range() {
        let cache = MemoryContentCache::new();
        cache
            .store("abc", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let got = cache.get_range("abc", 2, 3).await.unwrap().unwrap();
        assert_eq!(&got[..], b"234");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.stores(), 1);
    }

    #[tokio::test]
    async fn test_memory_cache_range_clamped() {
        let cache = MemoryContentCache::new();
        cache.store("abc", Bytes::from_static(b"0123")).await.unwrap();

        let got = cache.get_range("abc", 2, 10).await.unwrap().unwrap();
        assert_eq!(&got[..], b"23");
        let got = cache.get_range("abc", 10, 2).await.unwrap().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_http_cache_url() {
        let cache = HttpContentCache::new("http://cache.local:8080/layers/");
        assert_eq!(
            cache.object_url("deadbeef"),
            "http://cache.local:8080/layers/deadbeef"
        );
    }
}
