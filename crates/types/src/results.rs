//! Aggregated window results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::EventKind;

/// Count of events for one grouping key in one tumbling window
///
/// This is the record published to the aggregated topics. Window bounds are
/// serialised as epoch milliseconds; `window_end` is exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatedResult {
    /// Grouping key the events were counted under
    pub key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub window_end: DateTime<Utc>,
    /// Number of events observed in the window
    pub count: u64,
    pub event_type: EventKind,
}

impl AggregatedResult {
    pub fn new(
        key: impl Into<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        count: u64,
        event_type: EventKind,
    ) -> Self {
        Self {
            key: key.into(),
            window_start,
            window_end,
            count,
            event_type,
        }
    }

    /// Identifier of the (key, window) pair, stable across re-emissions
    pub fn window_id(&self) -> String {
        format!(
            "{}@{}_{}",
            self.key,
            self.window_start.timestamp_millis(),
            self.window_end.timestamp_millis()
        )
    }
}
