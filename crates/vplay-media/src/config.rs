//! Media configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::command::{EXTRACTOR_TOOL, TRANSCODER_TOOL};
use crate::executor::{ProcessExecutor, DEFAULT_OUTPUT_LIMIT};

/// Media configuration.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Directory holding transcoded artifacts
    pub work_dir: PathBuf,
    /// Maximum number of entries in the conversion cache
    pub conversion_capacity: usize,
    /// Container extension of transcoded artifacts
    pub conversion_extension: String,
    /// TTL for metadata whose stream URLs carry no expiry
    pub metadata_ttl: Duration,
    /// Budget for one extractor run
    pub extract_timeout: Option<Duration>,
    /// Budget for one transcode; `None` disables the limit
    pub transcode_timeout: Option<Duration>,
    /// Bytes captured per tool output stream; `None` keeps everything
    pub output_limit: Option<usize>,
    /// Absolute path of the extractor binary
    pub ytdlp_path: Option<PathBuf>,
    /// Absolute path of the transcoder binary
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("vplay"),
            conversion_capacity: 8,
            conversion_extension: "mp4".to_string(),
            metadata_ttl: Duration::from_secs(3600), // 1 hour
            extract_timeout: Some(Duration::from_secs(60)),
            transcode_timeout: Some(Duration::from_secs(600)), // 10 minutes
            output_limit: Some(DEFAULT_OUTPUT_LIMIT),
            ytdlp_path: None,
            ffmpeg_path: None,
        }
    }
}

impl MediaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let path = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        };

        Self {
            work_dir: path("VPLAY_WORK_DIR").unwrap_or(defaults.work_dir),
            conversion_capacity: lookup("VPLAY_CONVERSION_CAPACITY")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(defaults.conversion_capacity)
                .max(1),
            conversion_extension: lookup("VPLAY_CONVERSION_EXTENSION")
                .map(|s| s.trim().trim_start_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.conversion_extension),
            metadata_ttl: secs("VPLAY_METADATA_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.metadata_ttl),
            extract_timeout: match secs("VPLAY_EXTRACT_TIMEOUT_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => defaults.extract_timeout,
            },
            transcode_timeout: match secs("VPLAY_TRANSCODE_TIMEOUT_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => defaults.transcode_timeout,
            },
            output_limit: match lookup("VPLAY_OUTPUT_LIMIT_BYTES")
                .and_then(|s| s.trim().parse::<usize>().ok())
            {
                Some(0) => None,
                Some(bytes) => Some(bytes),
                None => defaults.output_limit,
            },
            ytdlp_path: path("VPLAY_YTDLP_PATH"),
            ffmpeg_path: path("VPLAY_FFMPEG_PATH"),
        }
    }

    /// Register configured tool paths with `executor`.
    pub fn apply_tool_paths(&self, executor: &ProcessExecutor) {
        if let Some(path) = &self.ytdlp_path {
            executor.set_tool_path(EXTRACTOR_TOOL, path);
        }
        if let Some(path) = &self.ffmpeg_path {
            executor.set_tool_path(TRANSCODER_TOOL, path);
        }
    }
}
