//! Error types for external tool orchestration.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while invoking external tools or managing caches.
///
/// `Timeout`, `Cancelled` and `ToolFailure` are mutually exclusive: a process
/// killed because its budget ran out is never reported as a tool failure.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{tool} failed: {message}")]
    ToolFailure {
        tool: String,
        /// `None` when the process was terminated by a signal
        exit_code: Option<i32>,
        message: String,
        stderr: String,
    },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stderr fragments that indicate a transient condition inside the tool.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "temporary failure in name resolution",
    "network is unreachable",
    "http error 429",
    "too many requests",
    "http error 5",
    "server returned 5",
    "broken pipe",
];

/// Stderr fragments that mean retrying will not help.
const PERMANENT_PATTERNS: &[&str] = &[
    "private video",
    "video is private",
    "video unavailable",
    "video is unavailable",
    "video has been removed",
    "not available in your country",
    "sign in to confirm your age",
    "unsupported url",
    "http error 404",
    "server returned 404",
    "no such file or directory",
];

impl MediaError {
    /// Create an invalid invocation error.
    pub fn invalid_invocation(message: impl Into<String>) -> Self {
        Self::InvalidInvocation(message.into())
    }

    /// Create a tool failure error.
    pub fn tool_failed(
        tool: impl Into<String>,
        exit_code: Option<i32>,
        message: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ToolFailure {
            tool: tool.into(),
            exit_code,
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a filesystem error for `path`.
    pub fn filesystem(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MediaError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MediaError::Timeout(_))
    }

    /// Captured stderr of a failed tool run.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            MediaError::ToolFailure { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Check if a retry (possibly with a larger budget) may succeed.
    ///
    /// Cancellation is never retryable: the caller withdrew interest.
    pub fn is_retryable(&self) -> bool {
        match self {
            MediaError::Timeout(_) => true,
            MediaError::ToolFailure { .. } => {
                !self.is_permanent_failure() && self.stderr_matches(TRANSIENT_PATTERNS)
            }
            MediaError::Cancelled
            | MediaError::InvalidInvocation(_)
            | MediaError::Filesystem { .. } => false,
        }
    }

    /// Check if the tool reported a condition retrying will not fix.
    pub fn is_permanent_failure(&self) -> bool {
        match self {
            MediaError::InvalidInvocation(_) => true,
            MediaError::ToolFailure { .. } => self.stderr_matches(PERMANENT_PATTERNS),
            _ => false,
        }
    }

    /// Label used for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            MediaError::InvalidInvocation(_) => "invalid_invocation",
            MediaError::Timeout(_) => "timeout",
            MediaError::Cancelled => "cancelled",
            MediaError::ToolFailure { .. } => "tool_failure",
            MediaError::Filesystem { .. } => "filesystem",
        }
    }

    fn stderr_matches(&self, patterns: &[&str]) -> bool {
        let Some(stderr) = self.stderr() else {
            return false;
        };
        let stderr = stderr.to_lowercase();
        patterns.iter().any(|p| stderr.contains(p))
    }
}
