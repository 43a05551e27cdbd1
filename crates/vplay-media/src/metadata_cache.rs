//! Metadata cache with lazy expiry.
//!
//! Entries expire at the earliest expiry embedded in their stream URLs, or
//! after a fixed TTL when none is present. Expired entries are invisible to
//! readers; `purge_expired` reclaims their memory.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vplay_models::{extract_identifier, trim_url, VideoMetadata};

use crate::error::MediaResult;
use crate::extractor::MetadataSource;
use crate::metrics::{self, caches, EvictionReason};

/// Cache key: identifier form when recognised, else the trimmed URL.
pub fn cache_key(url: &str) -> String {
    extract_identifier(url)
        .map(|id| id.to_string())
        .unwrap_or_else(|| trim_url(url))
}

#[derive(Debug, Clone)]
struct MetadataEntry {
    metadata: Arc<VideoMetadata>,
    expires_at: DateTime<Utc>,
}

impl MetadataEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Memoizes [`MetadataSource`] results.
pub struct MetadataCache {
    source: Arc<dyn MetadataSource>,
    default_ttl: Duration,
    entries: RwLock<HashMap<String, MetadataEntry>>,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, default_ttl: Duration) -> Self {
        Self {
            source,
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return live metadata for `url`, fetching on a miss or expiry.
    ///
    /// Failures leave the cache untouched.
    pub async fn resolve(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> MediaResult<Arc<VideoMetadata>> {
        let key = cache_key(url);

        if let Some(metadata) = self.live_entry(&key) {
            metrics::record_lookup(caches::METADATA, true);
            debug!(key = %key, "Metadata cache hit");
            return Ok(metadata);
        }
        metrics::record_lookup(caches::METADATA, false);

        let metadata = Arc::new(self.source.fetch(url.trim(), cancel).await?);
        let now = Utc::now();
        let expires_at = metadata
            .earliest_expiry()
            .unwrap_or_else(|| expiry_after(now, self.default_ttl));

        let replaced = self.write().insert(
            key.clone(),
            MetadataEntry {
                metadata: metadata.clone(),
                expires_at,
            },
        );
        if replaced.is_some_and(|old| !old.is_live(now)) {
            metrics::record_evictions(caches::METADATA, EvictionReason::Expired, 1);
        }

        debug!(key = %key, expires_at = %expires_at, "Metadata cached");
        Ok(metadata)
    }

    /// Non-resolving read; honours expiry.
    pub fn peek(&self, url: &str) -> Option<Arc<VideoMetadata>> {
        self.live_entry(&cache_key(url))
    }

    /// Expiry of the live entry for `url`.
    pub fn expires_at(&self, url: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.read()
            .get(&cache_key(url))
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at)
    }

    pub fn invalidate(&self, url: &str) -> bool {
        let removed = self.write().remove(&cache_key(url)).is_some();
        if removed {
            metrics::record_evictions(caches::METADATA, EvictionReason::Invalidated, 1);
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.write();
        metrics::record_evictions(caches::METADATA, EvictionReason::Invalidated, entries.len() as u64);
        entries.clear();
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let purged = before - entries.len();
        metrics::record_evictions(caches::METADATA, EvictionReason::Expired, purged as u64);
        purged
    }

    /// Stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_entry(&self, key: &str) -> Option<Arc<VideoMetadata>> {
        let now = Utc::now();
        self.read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.metadata.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MetadataEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MetadataEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vplay_models::StreamDescriptor;

    /// Returns one stream at `stream_url`, counting calls.
    struct FakeSource {
        stream_url: String,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeSource {
        fn new(stream_url: &str) -> Arc<Self> {
            Arc::new(Self {
                stream_url: stream_url.to_string(),
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for FakeSource {
        async fn fetch(&self, url: &str, _cancel: &CancellationToken) -> MediaResult<VideoMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MediaError::tool_failed("yt-dlp", Some(1), "exited", "HTTP Error 404"));
            }
            Ok(VideoMetadata {
                source_url: url.to_string(),
                identifier: extract_identifier(url),
                title: "title".to_string(),
                duration_secs: Some(1.0),
                streams: vec![StreamDescriptor::from_url(self.stream_url.clone())],
            })
        }
    }

    const UNSIGNED: &str = "https://cdn.example.com/v.mp4";

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let source = FakeSource::new(UNSIGNED);
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let a = cache.resolve("https://example.com/v", &cancel).await.unwrap();
        let b = cache.resolve("https://example.com/v#t=10", &cancel).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.calls(), 1);
        assert!(cache.expires_at("https://example.com/v").unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_identifier_shapes_share_an_entry() {
        let source = FakeSource::new(UNSIGNED);
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        cache.resolve("https://youtu.be/dQw4w9WgXcQ", &cancel).await.unwrap();
        cache
            .resolve("https://www.youtube.com/watch?v=dQw4w9WgXcQ&utm_source=x", &cancel)
            .await
            .unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(cache_key("https://youtu.be/dQw4w9WgXcQ"), "youtube:dQw4w9WgXcQ");
    }

    #[tokio::test]
    async fn test_embedded_past_expiry_forces_refetch() {
        let source = FakeSource::new("https://cdn.example.com/v.mp4?expire=1700000000");
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        cache.resolve("https://example.com/v", &cancel).await.unwrap();
        assert!(cache.peek("https://example.com/v").is_none());

        cache.resolve("https://example.com/v", &cancel).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let source = FakeSource::new(UNSIGNED);
        let cache = MetadataCache::new(source.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();

        cache.resolve("https://example.com/v", &cancel).await.unwrap();
        cache.resolve("https://example.com/v", &cancel).await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let source = FakeSource::new(UNSIGNED);
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        cache.resolve("https://example.com/a", &cancel).await.unwrap();
        cache.resolve("https://example.com/b", &cancel).await.unwrap();

        assert!(cache.invalidate("https://example.com/a"));
        assert!(!cache.invalidate("https://example.com/a"));
        assert!(cache.peek("https://example.com/a").is_none());
        assert!(cache.peek("https://example.com/b").is_some());

        cache.clear();
        assert!(cache.is_empty());

        cache.resolve("https://example.com/b", &cancel).await.unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let source = Arc::new(FakeSource {
            stream_url: UNSIGNED.to_string(),
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = MetadataCache::new(source.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        assert!(cache.resolve("https://example.com/v", &cancel).await.is_err());
        assert!(cache.resolve("https://example.com/v", &cancel).await.is_err());

        assert_eq!(source.calls(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expiry_after_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, Duration::from_secs(10)), now + TimeDelta::seconds(10));
        assert_eq!(expiry_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
