//! Window assigners
//!
//! Window policy is pluggable through [`WindowAssigner`]; the aggregator uses
//! the tumbling policy.

use super::types::WindowBounds;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;

/// Trait for assigning events to windows
pub trait WindowAssigner: Send + Sync + fmt::Debug {
    /// Assign a timestamp to one or more windows
    fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<WindowBounds>;

    /// Get the maximum number of windows an event can be assigned to
    fn max_windows_per_event(&self) -> usize {
        1
    }
}

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows. Each event is assigned to
/// exactly one window based on its timestamp.
///
/// # Example
/// ```text
/// Window size: 60 seconds
/// Event at 5s  -> Window [0, 60)
/// Event at 61s -> Window [60, 120)
/// Event at -1s -> Window [-60, 0)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    /// Size of each window
    size: Duration,
    /// Optional offset for window alignment
    offset: Duration,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    pub fn new(size: Duration) -> Self {
        assert!(size > Duration::zero(), "Window size must be positive");
        Self {
            size,
            offset: Duration::zero(),
        }
    }

    /// Create a tumbling window assigner with an offset
    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// Calculate the window start for a given timestamp (floor division)
    fn window_start(&self, timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ts_millis = timestamp.timestamp_millis();
        let offset_millis = self.offset.num_milliseconds();
        let size_millis = self.size.num_milliseconds();

        let aligned = ts_millis
            .checked_sub(offset_millis)?
            .div_euclid(size_millis)
            .checked_mul(size_millis)?
            .checked_add(offset_millis)?;

        Utc.timestamp_millis_opt(aligned).single()
    }
}

impl WindowAssigner for TumblingWindowAssigner {
    /// Empty when the window would end past the representable time range
    fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<WindowBounds> {
        self.window_start(timestamp)
            .and_then(|start| {
                start
                    .checked_add_signed(self.size)
                    .map(|end| WindowBounds::new(start, end))
            })
            .into_iter()
            .collect()
    }
}
