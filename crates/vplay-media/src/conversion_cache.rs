//! Content-addressed conversion cache.
//!
//! Maps a remote stream URL to a local, stream-copied artifact in the work
//! directory. The index is bounded by capacity and evicts oldest-created
//! first; reads do not refresh recency.
//!
//! Invariant: an indexed entry's file exists. Lookups that find the file
//! gone drop the entry and report a miss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::{RemuxCommand, TRANSCODER_TOOL};
use crate::config::MediaConfig;
use crate::error::{MediaError, MediaResult};
use crate::executor::ProcessExecutor;
use crate::fs_utils;
use crate::metrics::{self, caches, EvictionReason};

/// Lowercase hex SHA-256 of `source_url`.
pub fn content_address(source_url: &str) -> String {
    let digest = Sha256::digest(source_url.as_bytes());
    format!("{:x}", digest)
}

/// One materialized artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionEntry {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Tie-breaker for entries created within the same clock tick
    seq: u64,
}

type Gate = Arc<AsyncMutex<()>>;

/// Conversion cache over a [`ProcessExecutor`].
pub struct ConversionCache {
    executor: Arc<ProcessExecutor>,
    work_dir: PathBuf,
    extension: String,
    capacity: usize,
    transcode_timeout: Option<Duration>,
    entries: Mutex<HashMap<String, ConversionEntry>>,
    in_flight: Mutex<HashMap<String, Gate>>,
    next_seq: AtomicU64,
}

impl ConversionCache {
    /// Create a cache writing into `work_dir`. Capacity is clamped to 1.
    pub fn new(executor: Arc<ProcessExecutor>, work_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            executor,
            work_dir: work_dir.into(),
            extension: "mp4".to_string(),
            capacity: capacity.max(1),
            transcode_timeout: None,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(executor: Arc<ProcessExecutor>, config: &MediaConfig) -> Self {
        Self::new(executor, &config.work_dir, config.conversion_capacity)
            .with_extension(&config.conversion_extension)
            .with_timeout(config.transcode_timeout)
    }

    /// Set the output container extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Set the per-transcode timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transcode_timeout = timeout;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deterministic artifact path for `source_url`.
    pub fn output_path(&self, source_url: &str) -> PathBuf {
        self.path_for_key(&content_address(source_url))
    }

    /// Return a local file for `source_url`, transcoding on a miss.
    ///
    /// Concurrent misses for the same URL run the transcoder once; late
    /// arrivals wait and then read the published entry.
    pub async fn materialize(
        &self,
        source_url: &str,
        cancel: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        let key = content_address(source_url);

        if let Some(path) = self.lookup(&key).await {
            metrics::record_lookup(caches::CONVERSION, true);
            debug!(key = %key, path = %path.display(), "Conversion cache hit");
            return Ok(path);
        }
        metrics::record_lookup(caches::CONVERSION, false);

        let _key_lock = self.lock_key(&key, cancel).await?;

        // Another caller may have published while we waited
        if let Some(path) = self.lookup(&key).await {
            debug!(key = %key, "Conversion finished by concurrent caller");
            return Ok(path);
        }

        self.convert(&key, source_url, cancel).await
    }

    /// Drop the entry for `source_url` and delete its file.
    pub async fn invalidate(&self, source_url: &str) -> bool {
        let key = content_address(source_url);
        let removed = self.lock_entries().remove(&key);
        match removed {
            Some(entry) => {
                debug!(key = %key, "Conversion entry invalidated");
                metrics::record_evictions(caches::CONVERSION, EvictionReason::Invalidated, 1);
                fs_utils::remove_best_effort(&entry.path).await;
                true
            }
            None => false,
        }
    }

    /// Drop every entry and delete the files.
    pub async fn clear(&self) {
        let drained: Vec<ConversionEntry> = self.lock_entries().drain().map(|(_, e)| e).collect();
        metrics::record_evictions(
            caches::CONVERSION,
            EvictionReason::Invalidated,
            drained.len() as u64,
        );
        for entry in drained {
            fs_utils::remove_best_effort(&entry.path).await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the index holds an entry for `source_url`.
    pub fn contains(&self, source_url: &str) -> bool {
        self.lock_entries().contains_key(&content_address(source_url))
    }

    /// Snapshot of the entry for `source_url`.
    pub fn entry(&self, source_url: &str) -> Option<ConversionEntry> {
        self.lock_entries().get(&content_address(source_url)).cloned()
    }

    async fn convert(
        &self,
        key: &str,
        source_url: &str,
        cancel: &CancellationToken,
    ) -> MediaResult<PathBuf> {
        self.evict_to_fit().await;

        fs_utils::ensure_dir(&self.work_dir).await?;
        let output = self.path_for_key(key);
        if fs_utils::remove_if_exists(&output).await? {
            debug!(path = %output.display(), "Removed stale artifact");
        }

        let args = RemuxCommand::new(source_url, &output).build();
        let run = self
            .executor
            .execute(TRANSCODER_TOOL, &args.render(), cancel, self.transcode_timeout)
            .await
            .and_then(|result| result.into_success(TRANSCODER_TOOL));

        let result = match run {
            Ok(result) => result,
            Err(e) => {
                fs_utils::remove_best_effort(&output).await;
                return Err(e);
            }
        };

        if !fs_utils::is_file(&output).await {
            return Err(MediaError::tool_failed(
                TRANSCODER_TOOL,
                result.exit_code,
                "no output file produced",
                result.stderr,
            ));
        }

        let entry = ConversionEntry {
            path: output.clone(),
            created_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let evicted = {
            let mut entries = self.lock_entries();
            let evicted = take_oldest_until(&mut entries, self.capacity - 1);
            entries.insert(key.to_string(), entry);
            evicted
        };
        self.discard(evicted).await;

        info!(key = %key, path = %output.display(), "Conversion cached");
        Ok(output)
    }

    /// Capacity pass run before a transcode starts.
    async fn evict_to_fit(&self) {
        let evicted = take_oldest_until(&mut self.lock_entries(), self.capacity - 1);
        self.discard(evicted).await;
    }

    async fn discard(&self, evicted: Vec<(String, ConversionEntry)>) {
        if evicted.is_empty() {
            return;
        }
        metrics::record_evictions(caches::CONVERSION, EvictionReason::Capacity, evicted.len() as u64);
        for (key, entry) in evicted {
            debug!(key = %key, path = %entry.path.display(), "Evicting conversion entry");
            fs_utils::remove_best_effort(&entry.path).await;
        }
    }

    /// Indexed path for `key`, dropping the entry if its file is gone.
    async fn lookup(&self, key: &str) -> Option<PathBuf> {
        let entry = self.lock_entries().get(key).cloned()?;
        if fs_utils::is_file(&entry.path).await {
            return Some(entry.path);
        }

        let mut entries = self.lock_entries();
        if entries.get(key).map(|current| current.seq) == Some(entry.seq) {
            entries.remove(key);
            debug!(key = %key, path = %entry.path.display(), "Cached artifact vanished");
        }
        None
    }

    async fn lock_key(&self, key: &str, cancel: &CancellationToken) -> MediaResult<KeyLock<'_>> {
        let gate = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            in_flight.entry(key.to_string()).or_default().clone()
        };
        let mut key_lock = KeyLock {
            in_flight: &self.in_flight,
            key: key.to_string(),
            gate: gate.clone(),
            guard: None,
        };

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MediaError::Cancelled),
            guard = gate.lock_owned() => guard,
        };
        key_lock.guard = Some(guard);
        Ok(key_lock)
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.work_dir.join(format!("{}.{}", key, self.extension))
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, ConversionEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Remove oldest entries until at most `limit` remain.
fn take_oldest_until(
    entries: &mut HashMap<String, ConversionEntry>,
    limit: usize,
) -> Vec<(String, ConversionEntry)> {
    let mut evicted = Vec::new();
    while entries.len() > limit {
        let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, e)| (e.created_at, e.seq))
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        if let Some(entry) = entries.remove(&oldest) {
            evicted.push((oldest, entry));
        }
    }
    evicted
}

/// Exclusive claim on one key's conversion.
struct KeyLock<'a> {
    in_flight: &'a Mutex<HashMap<String, Gate>>,
    key: String,
    gate: Gate,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let idle = in_flight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.gate) && Arc::strong_count(&self.gate) <= 2);
        if idle {
            in_flight.remove(&self.key);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use vplay_models::sanitize_for_shell;

    /// Fake transcoder: logs each run, optionally sleeps, writes the last argument.
    fn fake_transcoder(dir: &Path, delay: &str, exit_code: i32) -> PathBuf {
        let script = dir.join("fake-ffmpeg");
        let log = dir.join("runs.log");
        let body = format!(
            "#!/bin/sh\necho run >> {log}\nsleep {delay}\nfor last; do :; done\nprintf media > \"$last\"\necho 'Server returned 404 Not Found' >&2\nexit {code}\n",
            log = sanitize_for_shell(&log.to_string_lossy()),
            delay = delay,
            code = exit_code,
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn runs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("runs.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn cache(dir: &TempDir, capacity: usize, delay: &str, exit_code: i32) -> ConversionCache {
        let executor = Arc::new(ProcessExecutor::new());
        executor.set_tool_path(TRANSCODER_TOOL, fake_transcoder(dir.path(), delay, exit_code));
        ConversionCache::new(executor, dir.path().join("out"), capacity)
    }

    #[test]
    fn test_content_address_is_stable_hex() {
        let a = content_address("https://cdn.example.com/a.m3u8");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(a, content_address("https://cdn.example.com/a.m3u8"));
        assert_ne!(a, content_address("https://cdn.example.com/b.m3u8"));
        assert_eq!(
            content_address(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_second_materialize_is_a_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 4, "0", 0);
        let cancel = CancellationToken::new();

        let first = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        let second = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, cache.output_path("https://cdn.example.com/a"));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "media");
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_capacity_one_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 1, "0", 0);
        let cancel = CancellationToken::new();

        let a = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        let b = cache.materialize("https://cdn.example.com/b", &cancel).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert!(!cache.contains("https://cdn.example.com/a"));
        assert!(!a.exists());
        assert!(b.exists());

        let again = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        assert_eq!(again, a);
        assert_eq!(runs(dir.path()), 3);
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_vanished_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 4, "0", 0);
        let cancel = CancellationToken::new();

        let path = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let path = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        assert!(path.exists());
        assert_eq!(runs(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_failure_leaves_no_entry_or_partial_file() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 4, "0", 1);
        let cancel = CancellationToken::new();

        let err = cache
            .materialize("https://cdn.example.com/missing", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::ToolFailure { exit_code: Some(1), .. }));
        assert!(err.is_permanent_failure());
        assert!(cache.is_empty());
        assert!(!cache.output_path("https://cdn.example.com/missing").exists());
    }

    #[tokio::test]
    async fn test_timeout_propagates_unchanged() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 4, "5", 0).with_timeout(Some(Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        let err = cache
            .materialize("https://cdn.example.com/slow", &cancel)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_transcode_once() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(&dir, 4, "0.3", 0));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            cache.materialize("https://cdn.example.com/a", &cancel),
            cache.materialize("https://cdn.example.com/a", &cancel),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(runs(dir.path()), 1);
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_cancellation() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(&dir, 4, "0.5", 0));
        let owner_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();

        let owner = {
            let cache = cache.clone();
            let cancel = owner_cancel.clone();
            tokio::spawn(async move { cache.materialize("https://cdn.example.com/a", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        waiter_cancel.cancel();
        let err = cache
            .materialize("https://cdn.example.com/a", &waiter_cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        assert!(owner.await.unwrap().is_ok());
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, 4, "0", 0);
        let cancel = CancellationToken::new();

        let a = cache.materialize("https://cdn.example.com/a", &cancel).await.unwrap();
        let b = cache.materialize("https://cdn.example.com/b", &cancel).await.unwrap();
        assert!(cache.entry("https://cdn.example.com/a").unwrap().created_at <= Utc::now());

        assert!(cache.invalidate("https://cdn.example.com/a").await);
        assert!(!cache.invalidate("https://cdn.example.com/a").await);
        assert!(!a.exists());

        cache.clear().await;
        assert!(cache.is_empty());
        assert!(!b.exists());
    }

    #[test]
    fn test_take_oldest_until_uses_seq_for_ties() {
        let now = Utc::now();
        let mut entries = HashMap::new();
        for (key, seq) in [("b", 1), ("a", 0), ("c", 2)] {
            entries.insert(
                key.to_string(),
                ConversionEntry {
                    path: PathBuf::from(key),
                    created_at: now,
                    seq,
                },
            );
        }

        let evicted = take_oldest_until(&mut entries, 1);
        let keys: Vec<_> = evicted.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);
        assert!(entries.contains_key("c"));
    }
}
