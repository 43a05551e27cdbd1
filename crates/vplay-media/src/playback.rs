//! Playback preparation.
//!
//! Ties the metadata cache and the conversion cache together: resolve a
//! video reference, pick the best stream, and either hand back its remote
//! URL or materialize it locally.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vplay_models::VideoMetadata;

use crate::command::EXTRACTOR_TOOL;
use crate::config::MediaConfig;
use crate::conversion_cache::ConversionCache;
use crate::error::{MediaError, MediaResult};
use crate::executor::ProcessExecutor;
use crate::extractor::YtDlpExtractor;
use crate::metadata_cache::MetadataCache;

/// How the caller wants to play the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    /// Play the remote stream URL directly
    #[default]
    Stream,
    /// Remux to a local file first
    Local,
}

impl PlaybackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackMode::Stream => "stream",
            PlaybackMode::Local => "local",
        }
    }
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaybackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "remote" => Ok(PlaybackMode::Stream),
            "local" | "file" => Ok(PlaybackMode::Local),
            other => Err(format!("unknown playback mode: {}", other)),
        }
    }
}

/// Something a player can open.
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    Remote {
        url: String,
        metadata: Arc<VideoMetadata>,
    },
    Local {
        path: PathBuf,
        metadata: Arc<VideoMetadata>,
    },
}

impl PlaybackSource {
    pub fn metadata(&self) -> &VideoMetadata {
        match self {
            PlaybackSource::Remote { metadata, .. } | PlaybackSource::Local { metadata, .. } => {
                metadata
            }
        }
    }

    /// URL or path as a string.
    pub fn location(&self) -> String {
        match self {
            PlaybackSource::Remote { url, .. } => url.clone(),
            PlaybackSource::Local { path, .. } => path.to_string_lossy().into_owned(),
        }
    }
}

/// Prepares playback sources.
#[derive(Clone)]
pub struct PlaybackService {
    metadata: Arc<MetadataCache>,
    conversions: Arc<ConversionCache>,
}

impl PlaybackService {
    pub fn new(metadata: Arc<MetadataCache>, conversions: Arc<ConversionCache>) -> Self {
        Self {
            metadata,
            conversions,
        }
    }

    /// Wire yt-dlp and ffmpeg through one shared executor.
    pub fn from_config(executor: Arc<ProcessExecutor>, config: &MediaConfig) -> Self {
        config.apply_tool_paths(&executor);

        let extractor = YtDlpExtractor::new(executor.clone()).with_timeout(config.extract_timeout);
        let metadata = MetadataCache::new(Arc::new(extractor), config.metadata_ttl);
        let conversions = ConversionCache::from_config(executor, config);

        Self::new(Arc::new(metadata), Arc::new(conversions))
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn conversion_cache(&self) -> &ConversionCache {
        &self.conversions
    }

    /// Resolve `url` and produce a source for `mode`.
    pub async fn prepare(
        &self,
        url: &str,
        mode: PlaybackMode,
        cancel: &CancellationToken,
    ) -> MediaResult<PlaybackSource> {
        let metadata = self.metadata.resolve(url, cancel).await?;
        let stream_url = metadata
            .best_stream()
            .map(|stream| stream.url.clone())
            .ok_or_else(|| {
                MediaError::tool_failed(
                    EXTRACTOR_TOOL,
                    None,
                    "no playable stream in metadata",
                    String::new(),
                )
            })?;

        let source = match mode {
            PlaybackMode::Stream => PlaybackSource::Remote {
                url: stream_url,
                metadata,
            },
            PlaybackMode::Local => {
                let path = self.conversions.materialize(&stream_url, cancel).await?;
                PlaybackSource::Local { path, metadata }
            }
        };

        info!(
            url = %url,
            mode = %mode,
            title = %source.metadata().title,
            "Playback source ready"
        );
        Ok(source)
    }

    /// Run [`prepare`](Self::prepare) on a task; the receiver completes once.
    pub fn prepare_in_background(
        &self,
        url: impl Into<String>,
        mode: PlaybackMode,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<MediaResult<PlaybackSource>> {
        let (tx, rx) = oneshot::channel();
        let service = self.clone();
        let url = url.into();

        tokio::spawn(async move {
            let result = service.prepare(&url, mode, &cancel).await;
            if tx.send(result).is_err() {
                debug!(url = %url, "Playback receiver dropped before completion");
            }
        });

        rx
    }
}
