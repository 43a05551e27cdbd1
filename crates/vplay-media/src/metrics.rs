//! Tool invocation and cache metrics.
//!
//! Provides standardized metrics for monitoring external tool orchestration:
//! - Invocation counters by tool and outcome
//! - Duration histograms
//! - Cache lookup and eviction counters

use metrics::{counter, histogram};
use std::time::Duration;

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total external tool invocations by tool and outcome.
    pub const TOOL_INVOCATIONS_TOTAL: &str = "vplay_tool_invocations_total";

    /// Wall-clock duration of tool invocations in seconds by tool and outcome.
    pub const TOOL_DURATION_SECONDS: &str = "vplay_tool_duration_seconds";

    /// Cache lookups by cache and result (hit/miss).
    pub const CACHE_LOOKUPS_TOTAL: &str = "vplay_cache_lookups_total";

    /// Cache evictions by cache and reason.
    pub const CACHE_EVICTIONS_TOTAL: &str = "vplay_cache_evictions_total";
}

/// Cache label values.
pub mod caches {
    pub const CONVERSION: &str = "conversion";
    pub const METADATA: &str = "metadata";
}

/// Eviction reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Capacity,
    Expired,
    Invalidated,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::Expired => "expired",
            EvictionReason::Invalidated => "invalidated",
        }
    }
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record a completed tool invocation.
pub fn record_invocation(tool: &str, outcome: &str, elapsed: Duration) {
    counter!(
        names::TOOL_INVOCATIONS_TOTAL,
        "tool" => tool.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        names::TOOL_DURATION_SECONDS,
        "tool" => tool.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a cache lookup.
pub fn record_lookup(cache: &'static str, hit: bool) {
    counter!(
        names::CACHE_LOOKUPS_TOTAL,
        "cache" => cache,
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record `count` evictions.
pub fn record_evictions(cache: &'static str, reason: EvictionReason, count: u64) {
    if count == 0 {
        return;
    }
    counter!(
        names::CACHE_EVICTIONS_TOTAL,
        "cache" => cache,
        "reason" => reason.as_str()
    )
    .increment(count);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::TOOL_INVOCATIONS_TOTAL.ends_with("_total"));
        assert!(names::TOOL_DURATION_SECONDS.ends_with("_seconds"));
        assert!(names::CACHE_LOOKUPS_TOTAL.contains("lookups"));
        assert!(names::CACHE_EVICTIONS_TOTAL.contains("evictions"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_invocation("ffmpeg", "success", Duration::from_millis(5));
        record_lookup(caches::CONVERSION, true);
        record_evictions(caches::METADATA, EvictionReason::Expired, 0);
        assert_eq!(EvictionReason::Capacity.as_str(), "capacity");
    }
}
