//! URL processing for remote video references.
//!
//! All functions here are pure: no I/O, no shared state. URLs are treated as
//! untrusted input, and nothing in this module ever panics on malformed text.
//!
//! - [`trim_url`] canonicalises a URL and strips tracking parameters
//! - [`extract_identifier`] recognises known platforms and returns a stable id
//! - [`parse_expiry`] reads the expiry embedded in signed CDN URLs
//! - [`sanitize_for_shell`] quotes text so it survives as a single shell word

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Query parameters that only carry attribution/tracking data.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "igshid", "si", "feature", "pp", "ab_channel",
    "mc_cid", "mc_eid", "ref_src",
];

/// Query parameters carrying a Unix expiry timestamp (compared case-insensitively).
const EXPIRY_PARAMS: &[&str] = &["expire", "expires", "exp", "x-expires"];

/// Timestamps above this are interpreted as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Errors that can occur during YouTube ID extraction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum YoutubeIdError {
    /// URL is not a valid YouTube URL
    #[error("URL is not a valid YouTube URL")]
    InvalidYoutubeUrl,
    /// Video ID has invalid format
    #[error("Video ID has invalid format")]
    InvalidVideoId,
    /// Video ID not found in URL
    #[error("Video ID not found in URL")]
    VideoIdNotFound,
}

/// Result type for YouTube ID extraction.
pub type YoutubeIdResult<T> = Result<T, YoutubeIdError>;

/// Video platform recognised by [`extract_identifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Vimeo,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Vimeo => "vimeo",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a remote video, e.g. `youtube:dQw4w9WgXcQ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoIdentifier {
    pub platform: Platform,
    pub id: String,
}

impl VideoIdentifier {
    pub fn new(platform: Platform, id: impl Into<String>) -> Self {
        Self {
            platform,
            id: id.into(),
        }
    }
}

impl fmt::Display for VideoIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.id)
    }
}

// ============================================================================
// Trimming
// ============================================================================

/// Strip tracking parameters and return a canonical form of `url`.
///
/// Recognised YouTube URLs collapse to `https://www.youtube.com/watch?v=<id>`.
/// Other URLs lose their fragment and any tracking query parameters; the
/// remaining query is left byte-for-byte intact unless something was removed.
/// Input that does not parse as a URL is returned whitespace-trimmed.
///
/// Idempotent: `trim_url(&trim_url(x)) == trim_url(x)`.
pub fn trim_url(url: &str) -> String {
    let raw = url.trim();

    if let Ok(id) = extract_youtube_id(raw) {
        return canonical_youtube_url(&id);
    }

    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.to_string();
    };

    let total = parsed.query_pairs().count();
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.len() != total {
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }
    parsed.set_fragment(None);

    parsed.to_string()
}

/// Canonical watch URL for a YouTube video id.
pub fn canonical_youtube_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

// ============================================================================
// Identifier extraction
// ============================================================================

/// Recognise a known URL shape and return its stable video identifier.
///
/// Returns `None` for unrecognised shapes; this is not an error condition.
pub fn extract_identifier(url: &str) -> Option<VideoIdentifier> {
    if let Ok(id) = extract_youtube_id(url) {
        return Some(VideoIdentifier::new(Platform::Youtube, id));
    }
    extract_vimeo_id(url).map(|id| VideoIdentifier::new(Platform::Vimeo, id))
}

/// Extract YouTube video ID from URL.
///
/// Supports:
/// - https://youtube.com/watch?v=VIDEO_ID
/// - https://youtu.be/VIDEO_ID
/// - https://youtube.com/embed/VIDEO_ID
/// - https://youtube.com/v/VIDEO_ID
/// - https://youtube.com/shorts/VIDEO_ID
/// - https://youtube.com/live/VIDEO_ID
/// - scheme-less variants, extra query parameters and fragments
///
/// Returns the 11-character YouTube video ID or an error.
pub fn extract_youtube_id(url: &str) -> YoutubeIdResult<String> {
    let parsed = parse_lenient(url).ok_or(YoutubeIdError::InvalidYoutubeUrl)?;
    let host = parsed
        .host_str()
        .ok_or(YoutubeIdError::InvalidYoutubeUrl)?
        .to_ascii_lowercase();

    if host == "youtu.be" || host.ends_with(".youtu.be") {
        return match first_segment(&parsed) {
            Some(id) => validate_youtube_id(id),
            None => Err(YoutubeIdError::VideoIdNotFound),
        };
    }

    if !is_youtube_host(&host) {
        return Err(YoutubeIdError::InvalidYoutubeUrl);
    }

    if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
        return validate_youtube_id(&id);
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [kind, id, ..] if matches!(*kind, "embed" | "v" | "shorts" | "live") => {
            validate_youtube_id(id)
        }
        _ => Err(YoutubeIdError::VideoIdNotFound),
    }
}

fn is_youtube_host(host: &str) -> bool {
    ["youtube.com", "youtube-nocookie.com"]
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
}

/// YouTube video IDs are exactly 11 characters of `[A-Za-z0-9_-]`.
fn validate_youtube_id(id: &str) -> YoutubeIdResult<String> {
    let id = id.trim();
    if id.len() != 11 {
        return Err(YoutubeIdError::InvalidVideoId);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(YoutubeIdError::InvalidVideoId);
    }
    Ok(id.to_string())
}

fn extract_vimeo_id(url: &str) -> Option<String> {
    let parsed = parse_lenient(url)?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    if host != "vimeo.com" && !host.ends_with(".vimeo.com") {
        return None;
    }
    parsed
        .path_segments()?
        .find(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

fn first_segment(url: &Url) -> Option<&str> {
    url.path_segments()?.next().filter(|seg| !seg.is_empty())
}

/// Parse an http(s) URL, accepting scheme-less input like `youtu.be/ID`.
fn parse_lenient(url: &str) -> Option<Url> {
    let url = url.trim();
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{}", url)).ok()?
        }
        Err(_) => return None,
    };
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}

// ============================================================================
// Expiry parsing
// ============================================================================

/// Parse the expiry timestamp embedded in a signed stream URL.
///
/// Recognises, in order:
/// - `expire`/`expires`/`exp`/`x-expires` query parameters (Unix seconds or millis)
/// - AWS SigV4 `X-Amz-Date` + `X-Amz-Expires`
/// - googlevideo path form `/expire/<secs>/`
///
/// Returns `None` when no parameter is present or it fails to parse.
pub fn parse_expiry(url: &str) -> Option<DateTime<Utc>> {
    let parsed = Url::parse(url.trim()).ok()?;

    let mut amz_date: Option<String> = None;
    let mut amz_expires: Option<i64> = None;

    for (key, value) in parsed.query_pairs() {
        if EXPIRY_PARAMS.iter().any(|p| key.eq_ignore_ascii_case(p)) {
            if let Some(ts) = unix_timestamp(&value) {
                return Some(ts);
            }
        } else if key.eq_ignore_ascii_case("x-amz-date") {
            amz_date = Some(value.into_owned());
        } else if key.eq_ignore_ascii_case("x-amz-expires") {
            amz_expires = value.trim().parse().ok();
        }
    }

    if let (Some(date), Some(expires)) = (amz_date, amz_expires) {
        if let Some(ts) = amz_expiry(&date, expires) {
            return Some(ts);
        }
    }

    let segments: Vec<&str> = parsed.path_segments()?.collect();
    segments
        .windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case("expire"))
        .and_then(|pair| unix_timestamp(pair[1]))
}

fn unix_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let n: i64 = value.trim().parse().ok()?;
    if n <= 0 {
        return None;
    }
    if n > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn amz_expiry(date: &str, expires_secs: i64) -> Option<DateTime<Utc>> {
    let signed_at = NaiveDateTime::parse_from_str(date.trim(), "%Y%m%dT%H%M%SZ")
        .ok()?
        .and_utc();
    signed_at.checked_add_signed(TimeDelta::try_seconds(expires_secs)?)
}

// ============================================================================
// Shell quoting
// ============================================================================

/// Quote `text` so that it is read back as exactly one shell word.
///
/// Text made only of characters no POSIX shell treats specially is returned
/// unchanged. Anything else is wrapped in single quotes, with embedded single
/// quotes written as `'\''`; inside single quotes no expansion (variables,
/// globs, braces, backticks) takes place. The empty string becomes `''`.
///
/// Every untrusted value placed on an external tool's command line goes
/// through this function.
pub fn sanitize_for_shell(text: &str) -> String {
    if !text.is_empty() && text.chars().all(is_shell_safe) {
        return text.to_string();
    }

    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '@' | '+' | '=' | '%')
}
