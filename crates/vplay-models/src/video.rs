//! Resolved video metadata models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::urls::{parse_expiry, VideoIdentifier};

/// One candidate stream returned by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Extractor-specific format id (e.g. yt-dlp `format_id`)
    pub format_id: Option<String>,
    /// Direct, usually signed, stream URL
    pub url: String,
    /// Container extension (mp4, webm, m3u8...)
    pub ext: Option<String>,
    /// Transport protocol (https, m3u8_native, dash...)
    pub protocol: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Video codec; `"none"` marks an audio-only stream
    pub vcodec: Option<String>,
    /// Audio codec; `"none"` marks a video-only stream
    pub acodec: Option<String>,
    /// Total bitrate in kbit/s
    pub bitrate_kbps: Option<f64>,
}

impl StreamDescriptor {
    /// Create a descriptor that only knows its URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            format_id: None,
            url: url.into(),
            ext: None,
            protocol: None,
            width: None,
            height: None,
            vcodec: None,
            acodec: None,
            bitrate_kbps: None,
        }
    }

    /// Unknown codecs count as present.
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    /// Stream carries both audio and video.
    pub fn is_progressive(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    /// Expiry embedded in the stream URL, if any.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        parse_expiry(&self.url)
    }

    fn bitrate(&self) -> f64 {
        self.bitrate_kbps.unwrap_or(0.0)
    }
}

/// Metadata resolved for one remote video reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// URL the caller asked for
    pub source_url: String,
    /// Stable identifier when the URL shape is recognised
    pub identifier: Option<VideoIdentifier>,
    pub title: String,
    /// Duration in seconds (absent for live streams)
    pub duration_secs: Option<f64>,
    /// Candidate streams, in extractor order
    pub streams: Vec<StreamDescriptor>,
}

impl VideoMetadata {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Pick the stream best suited for playback.
    ///
    /// Progressive streams win, highest resolution first, then bitrate.
    /// Without a progressive stream the highest-bitrate stream is returned.
    pub fn best_stream(&self) -> Option<&StreamDescriptor> {
        self.streams
            .iter()
            .filter(|s| s.is_progressive())
            .max_by(|a, b| {
                a.height
                    .unwrap_or(0)
                    .cmp(&b.height.unwrap_or(0))
                    .then_with(|| a.bitrate().total_cmp(&b.bitrate()))
            })
            .or_else(|| {
                self.streams
                    .iter()
                    .max_by(|a, b| a.bitrate().total_cmp(&b.bitrate()))
            })
    }

    /// Earliest expiry embedded in any candidate stream URL.
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.streams.iter().filter_map(|s| s.expires_at()).min()
    }
}
