//! Watermarking for event-time window firing
//!
//! Watermarks represent a timestamp threshold indicating that all events with
//! timestamps below it are assumed to have arrived. Windows fire once the
//! watermark passes their end plus the allowed lateness.
//!
//! # Overview
//!
//! - Bounded out-of-orderness: watermark = max event time - max delay
//! - Per-partition tracking; the global watermark is the minimum over active partitions
//! - Idle partition detection
//! - Processing-time advance when every partition is idle
//!
//! # Example
//!
//! ```rust
//! use processor::watermark::{BoundedOutOfOrdernessWatermark, WatermarkGenerator};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! let mut generator = BoundedOutOfOrdernessWatermark::new(
//!     Duration::from_secs(5),
//!     Some(Duration::from_secs(60)),
//! );
//!
//! generator.on_event(10_000, 0, Utc::now());
//! assert_eq!(generator.current_watermark().timestamp, 5_000);
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::time::Duration;
use tracing::{debug, trace};

/// Represents a watermark timestamp
///
/// Watermarks indicate that all events with timestamps less than or equal to the watermark
/// have been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, if representable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) if !self.is_min() => write!(f, "Watermark({})", dt),
            _ => write!(f, "Watermark(min)"),
        }
    }
}

/// Trait for generating watermarks from event streams
///
/// `now` is passed in explicitly so idle handling follows the caller's clock.
pub trait WatermarkGenerator: Send + Sync {
    /// Called when a new event arrives; returns the watermark if it advanced
    fn on_event(&mut self, timestamp: i64, partition: i32, now: DateTime<Utc>) -> Option<Watermark>;

    /// Called periodically; returns the watermark if it advanced
    fn on_periodic_check(&mut self, now: DateTime<Utc>) -> Option<Watermark>;

    /// Gets the current watermark without advancing it
    fn current_watermark(&self) -> Watermark;

    /// Moves the watermark forward to at least `watermark` (used after restore)
    fn advance_to(&mut self, watermark: Watermark);

    /// Gets the watermark for a specific partition
    fn partition_watermark(&self, partition: i32) -> Option<Watermark>;
}

/// Bounded out-of-orderness watermark generator
///
/// Tracks the maximum timestamp per partition and derives watermarks by
/// subtracting a fixed delay. Partitions without events for the idle timeout
/// do not hold the global watermark back.
pub struct BoundedOutOfOrdernessWatermark {
    /// Maximum allowed out-of-orderness
    max_out_of_orderness: Duration,
    /// Timeout after which a partition is considered idle
    idle_timeout: Option<Duration>,
    /// Advance with processing time once all partitions are idle
    idle_advance: bool,
    /// Per-partition maximum timestamps
    partition_max_timestamps: DashMap<i32, i64>,
    /// Per-partition last activity time
    partition_last_activity: DashMap<i32, DateTime<Utc>>,
    /// Last event on any partition, or creation time
    last_activity: DateTime<Utc>,
    /// Current global watermark
    current_watermark: Watermark,
}

impl BoundedOutOfOrdernessWatermark {
    /// Creates a new bounded out-of-orderness watermark generator
    ///
    /// # Arguments
    /// * `max_out_of_orderness` - The maximum allowed delay for late events
    /// * `idle_timeout` - Optional timeout for detecting idle partitions
    pub fn new(max_out_of_orderness: Duration, idle_timeout: Option<Duration>) -> Self {
        Self {
            max_out_of_orderness,
            idle_timeout,
            idle_advance: idle_timeout.is_some(),
            partition_max_timestamps: DashMap::new(),
            partition_last_activity: DashMap::new(),
            last_activity: Utc::now(),
            current_watermark: Watermark::min(),
        }
    }

    /// Enable or disable processing-time advance on idleness
    pub fn with_idle_advance(mut self, enabled: bool) -> Self {
        self.idle_advance = enabled && self.idle_timeout.is_some();
        self
    }

    /// Reference point for idle detection before the first event
    pub fn with_start_time(mut self, now: DateTime<Utc>) -> Self {
        self.last_activity = now;
        self
    }

    /// Computes the watermark based on the maximum timestamp and configured delay
    fn compute_watermark(&self, max_ts: i64) -> Watermark {
        let delay_ms = self.max_out_of_orderness.as_millis() as i64;
        Watermark::new(max_ts.saturating_sub(delay_ms))
    }

    fn idle_timeout_chrono(&self) -> Option<ChronoDuration> {
        self.idle_timeout
            .and_then(|timeout| ChronoDuration::from_std(timeout).ok())
    }

    /// Checks if a partition is idle based on the configured timeout
    fn is_partition_idle(&self, partition: i32, now: DateTime<Utc>) -> bool {
        match (self.idle_timeout_chrono(), self.partition_last_activity.get(&partition)) {
            (Some(timeout), Some(last_activity)) => {
                now.signed_duration_since(*last_activity) >= timeout
            }
            _ => false,
        }
    }

    /// Gets all active partitions (non-idle)
    pub fn active_partitions(&self, now: DateTime<Utc>) -> Vec<i32> {
        self.partition_max_timestamps
            .iter()
            .filter(|entry| !self.is_partition_idle(*entry.key(), now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Gets all idle partitions
    pub fn idle_partitions(&self, now: DateTime<Utc>) -> Vec<i32> {
        self.partition_max_timestamps
            .iter()
            .filter(|entry| self.is_partition_idle(*entry.key(), now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Minimum watermark over active partitions
    ///
    /// The global watermark is the minimum of all partition watermarks to ensure
    /// we don't advance past events that haven't been processed yet
    fn merge_partition_watermarks(&self, now: DateTime<Utc>) -> Option<Watermark> {
        self.active_partitions(now)
            .into_iter()
            .filter_map(|partition| self.partition_watermark(partition))
            .min()
    }

    /// Processing-time watermark once every partition has been idle
    fn idle_watermark(&self, now: DateTime<Utc>) -> Option<Watermark> {
        if !self.idle_advance {
            return None;
        }
        let timeout = self.idle_timeout_chrono()?;
        if now.signed_duration_since(self.last_activity) < timeout {
            return None;
        }
        Some(Watermark::from_datetime(now - timeout))
    }

    fn advance(&mut self, candidate: Watermark) -> Option<Watermark> {
        if candidate > self.current_watermark {
            self.current_watermark = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    /// Checks if an event is late based on the current watermark
    pub fn is_late_event(&self, timestamp: i64) -> bool {
        timestamp < self.current_watermark.timestamp
    }
}

impl WatermarkGenerator for BoundedOutOfOrdernessWatermark {
    fn on_event(&mut self, timestamp: i64, partition: i32, now: DateTime<Utc>) -> Option<Watermark> {
        trace!(timestamp, partition, "Processing event for watermark");

        self.partition_last_activity.insert(partition, now);
        self.last_activity = max(self.last_activity, now);

        self.partition_max_timestamps
            .entry(partition)
            .and_modify(|max_ts| *max_ts = max(*max_ts, timestamp))
            .or_insert(timestamp);

        let merged = self.merge_partition_watermarks(now)?;
        self.advance(merged)
    }

    fn on_periodic_check(&mut self, now: DateTime<Utc>) -> Option<Watermark> {
        let candidate = match (self.merge_partition_watermarks(now), self.idle_watermark(now)) {
            (Some(event_time), Some(idle)) => max(event_time, idle),
            (Some(event_time), None) => event_time,
            (None, idle) => idle?,
        };

        let advanced = self.advance(candidate);
        if let Some(watermark) = advanced {
            debug!(watermark = %watermark, "Periodic watermark update");
        }
        advanced
    }

    fn current_watermark(&self) -> Watermark {
        self.current_watermark
    }

    fn advance_to(&mut self, watermark: Watermark) {
        self.advance(watermark);
    }

    fn partition_watermark(&self, partition: i32) -> Option<Watermark> {
        self.partition_max_timestamps
            .get(&partition)
            .map(|max_ts| self.compute_watermark(*max_ts))
    }
}
