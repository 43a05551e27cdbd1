//! External tool orchestration for video playback.
//!
//! This crate provides:
//! - A process executor with cancellation, timeouts and process-group cleanup
//! - Shell-safe command lines for yt-dlp and FFmpeg
//! - A content-addressed conversion cache with FIFO eviction
//! - A metadata cache with lazy, URL-driven expiry
//! - A playback facade combining both caches

pub mod command;
pub mod config;
pub mod conversion_cache;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod fs_utils;
pub mod metadata_cache;
pub mod metrics;
pub mod playback;

pub use command::{CommandLine, ExtractCommand, RemuxCommand, EXTRACTOR_TOOL, TRANSCODER_TOOL};
pub use config::MediaConfig;
pub use conversion_cache::{content_address, ConversionCache, ConversionEntry};
pub use error::{MediaError, MediaResult};
pub use executor::{ProcessExecutor, ProcessResult, DEFAULT_OUTPUT_LIMIT, TRUNCATION_MARKER};
pub use extractor::{parse_metadata, MetadataSource, YtDlpExtractor};
pub use metadata_cache::{cache_key, MetadataCache};
pub use playback::{PlaybackMode, PlaybackService, PlaybackSource};

// Re-exported so callers need not depend on tokio-util directly
pub use tokio_util::sync::CancellationToken;
