//! Metadata extraction through yt-dlp.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vplay_models::{extract_identifier, Platform, StreamDescriptor, VideoIdentifier, VideoMetadata};

use crate::command::{ExtractCommand, EXTRACTOR_TOOL};
use crate::error::{MediaError, MediaResult};
use crate::executor::ProcessExecutor;

/// Resolves a remote video reference into metadata.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> MediaResult<VideoMetadata>;
}

/// yt-dlp `--dump-single-json` output.
#[derive(Debug, Deserialize)]
struct YtDlpOutput {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    extractor_key: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    protocol: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
}

/// [`MetadataSource`] backed by the yt-dlp binary.
pub struct YtDlpExtractor {
    executor: Arc<ProcessExecutor>,
    timeout: Option<Duration>,
    format: Option<String>,
}

impl YtDlpExtractor {
    pub fn new(executor: Arc<ProcessExecutor>) -> Self {
        Self {
            executor,
            timeout: None,
            format: None,
        }
    }

    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Restrict format selection (yt-dlp `-f`).
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    fn command(&self, url: &str) -> ExtractCommand {
        let mut cmd = ExtractCommand::new(url);
        if let Some(format) = &self.format {
            cmd = cmd.format(format);
        }
        if let Some(timeout) = self.timeout {
            cmd = cmd.socket_timeout(timeout);
        }
        cmd
    }
}

#[async_trait]
impl MetadataSource for YtDlpExtractor {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> MediaResult<VideoMetadata> {
        let args = self.command(url).build();
        let result = self
            .executor
            .execute(EXTRACTOR_TOOL, &args.render(), cancel, self.timeout)
            .await?
            .into_success(EXTRACTOR_TOOL)?;

        let metadata = parse_metadata(url, &result.stdout)?;
        debug!(
            url = %url,
            title = %metadata.title,
            streams = metadata.streams.len(),
            "Extracted metadata"
        );
        Ok(metadata)
    }
}

/// Parse yt-dlp JSON into [`VideoMetadata`].
pub fn parse_metadata(source_url: &str, stdout: &str) -> MediaResult<VideoMetadata> {
    let output: YtDlpOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
        MediaError::tool_failed(
            EXTRACTOR_TOOL,
            Some(0),
            format!("unparseable metadata: {}", e),
            String::new(),
        )
    })?;

    let mut streams: Vec<StreamDescriptor> = output
        .formats
        .into_iter()
        .filter_map(|f| {
            let url = f.url.filter(|u| !u.is_empty())?;
            Some(StreamDescriptor {
                format_id: f.format_id,
                url,
                ext: f.ext,
                protocol: f.protocol,
                width: f.width,
                height: f.height,
                vcodec: f.vcodec,
                acodec: f.acodec,
                bitrate_kbps: f.tbr,
            })
        })
        .collect();

    if streams.is_empty() {
        if let Some(url) = output.url.filter(|u| !u.is_empty()) {
            streams.push(StreamDescriptor {
                ext: output.ext.clone(),
                ..StreamDescriptor::from_url(url)
            });
        }
    }

    if streams.is_empty() {
        return Err(MediaError::tool_failed(
            EXTRACTOR_TOOL,
            Some(0),
            "no playable stream in metadata",
            String::new(),
        ));
    }

    let identifier = extract_identifier(source_url)
        .or_else(|| output.webpage_url.as_deref().and_then(extract_identifier))
        .or_else(|| identifier_from_extractor(output.extractor_key.as_deref(), output.id.as_deref()));

    Ok(VideoMetadata {
        source_url: source_url.to_string(),
        identifier,
        title: output
            .title
            .or(output.id)
            .unwrap_or_else(|| source_url.to_string()),
        duration_secs: output.duration,
        streams,
    })
}

fn identifier_from_extractor(key: Option<&str>, id: Option<&str>) -> Option<VideoIdentifier> {
    let platform = match key? {
        "Youtube" => Platform::Youtube,
        "Vimeo" => Platform::Vimeo,
        _ => return None,
    };
    let id = id.filter(|id| !id.is_empty())?;
    Some(VideoIdentifier::new(platform, id))
}
