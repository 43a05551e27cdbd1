//! Filesystem utilities for cache artifacts.

use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Create `dir` and its parents if needed.
pub async fn ensure_dir(dir: impl AsRef<Path>) -> MediaResult<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .await
        .map_err(|e| MediaError::filesystem(dir, e))
}

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` if a file was actually removed.
pub async fn remove_if_exists(path: impl AsRef<Path>) -> MediaResult<bool> {
    let path = path.as_ref();
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MediaError::filesystem(path, e)),
    }
}

/// Remove a file, logging instead of failing.
pub async fn remove_best_effort(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if let Err(e) = remove_if_exists(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}

/// Check that `path` is a regular file.
pub async fn is_file(path: impl AsRef<Path>) -> bool {
    fs::metadata(path.as_ref())
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
