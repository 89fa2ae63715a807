//! Window types and bounds
//!
//! This module defines the core window types used for time-based aggregations
//! in the stream processor.

use crate::core::GroupingKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the time bounds of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create a new window bounds
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Get the duration of the window
    pub fn duration(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the window may fire: `end + allowed_lateness <= watermark`
    pub fn is_closed(&self, watermark_millis: i64, allowed_lateness: Duration) -> bool {
        self.end
            .timestamp_millis()
            .saturating_add(allowed_lateness.num_milliseconds())
            <= watermark_millis
    }

    /// Stable identifier `{start_ms}_{end_ms}`
    pub fn id(&self) -> String {
        format!(
            "{}_{}",
            self.start.timestamp_millis(),
            self.end.timestamp_millis()
        )
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// One grouping key in one window; the unit of accumulation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub key: GroupingKey,
    pub bounds: WindowBounds,
}

impl WindowKey {
    pub fn new(key: GroupingKey, bounds: WindowBounds) -> Self {
        Self { key, bounds }
    }
}

impl PartialOrd for WindowKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by window first, then by key
impl Ord for WindowKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bounds
            .cmp(&other.bounds)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.bounds.id())
    }
}
