//! Core event processing structures and traits
//!
//! This module provides the fundamental types for event processing in the stream processor:
//! - SourceRecord: raw message read from a source partition
//! - GroupingKey: key events are counted under
//! - EventTimeExtractor: Trait for extracting event timestamps
//! - KeyExtractor: Trait for extracting grouping keys

use adstream_types::AdEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Separator between the components of a composite key
pub const KEY_SEPARATOR: char = ':';

/// Placeholder for a key component the event does not carry
pub const UNKNOWN_COMPONENT: &str = "unknown";

/// Raw message as read from a source partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Undecoded payload; `None` for tombstones
    pub payload: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker or producer timestamp in epoch milliseconds, if any
    pub timestamp: Option<i64>,
}

impl SourceRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
        }
    }
}

/// Key events are grouped by before windowing
///
/// Composite keys join their components with `:`. Missing components are
/// replaced by `unknown`, so every event has a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupingKey(String);

impl GroupingKey {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.is_empty() {
            GroupingKey(UNKNOWN_COMPONENT.to_string())
        } else {
            GroupingKey(key)
        }
    }

    /// Build a composite key from optional components
    pub fn composite<'a>(parts: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        let mut key = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            match part.map(str::trim) {
                Some(value) if !value.is_empty() => key.push_str(value),
                _ => key.push_str(UNKNOWN_COMPONENT),
            }
        }
        GroupingKey::new(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupingKey {
    fn from(key: &str) -> Self {
        GroupingKey::new(key)
    }
}

impl From<GroupingKey> for String {
    fn from(key: GroupingKey) -> String {
        key.0
    }
}

/// Trait for extracting event time from events
///
/// Implement this trait to define how to extract the timestamp from your event type.
/// This is used for event time semantics in stream processing.
pub trait EventTimeExtractor<T>: Send + Sync {
    /// Extract the event timestamp from the event
    fn extract_event_time(&self, event: &T) -> DateTime<Utc>;
}

/// Trait for extracting grouping keys from events
///
/// Implementations must be pure and total: the same event always yields the
/// same key and no event is rejected.
pub trait KeyExtractor<T>: Send + Sync {
    /// Extract the grouping key from the event
    fn extract_key(&self, event: &T) -> GroupingKey;
}

/// Event time of any ad-exchange event
#[derive(Debug, Clone, Copy, Default)]
pub struct AdEventTimeExtractor;

impl<T: AdEvent> EventTimeExtractor<T> for AdEventTimeExtractor {
    fn extract_event_time(&self, event: &T) -> DateTime<Utc> {
        event.event_time()
    }
}

/// Groups events by campaign only
#[derive(Debug, Clone, Copy, Default)]
pub struct CampaignKeyExtractor;

impl<T: AdEvent> KeyExtractor<T> for CampaignKeyExtractor {
    fn extract_key(&self, event: &T) -> GroupingKey {
        GroupingKey::composite([event.campaign_id()])
    }
}

/// Groups events by campaign and creative (`campaign:creative`)
#[derive(Debug, Clone, Copy, Default)]
pub struct CampaignCreativeKeyExtractor;

impl<T: AdEvent> KeyExtractor<T> for CampaignCreativeKeyExtractor {
    fn extract_key(&self, event: &T) -> GroupingKey {
        GroupingKey::composite([event.campaign_id(), event.creative_id()])
    }
}

/// Closure-backed key extractor
pub struct FnKeyExtractor<T, F> {
    f: F,
    _event: PhantomData<fn(&T)>,
}

impl<T, F> FnKeyExtractor<T, F>
where
    F: Fn(&T) -> GroupingKey + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _event: PhantomData,
        }
    }
}

impl<T, F> KeyExtractor<T> for FnKeyExtractor<T, F>
where
    F: Fn(&T) -> GroupingKey + Send + Sync,
{
    fn extract_key(&self, event: &T) -> GroupingKey {
        (self.f)(event)
    }
}
