//! Shared data models for vplay.
//!
//! This crate provides:
//! - URL processing (trimming, identifier extraction, expiry parsing, shell quoting)
//! - Resolved video metadata and stream descriptors

pub mod urls;
pub mod video;

// Re-export common types
pub use urls::{
    canonical_youtube_url, extract_identifier, extract_youtube_id, parse_expiry,
    sanitize_for_shell, trim_url, Platform, VideoIdentifier, YoutubeIdError, YoutubeIdResult,
};
pub use video::{StreamDescriptor, VideoMetadata};
