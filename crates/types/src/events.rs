//! Ad-exchange event types
//!
//! Events arrive as JSON objects with camelCase field names. The event time
//! is carried as epoch milliseconds in the `timestamp` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of ad-exchange event, one per input stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BidRequest,
    BidResponse,
    WinNotification,
    Impression,
    Click,
}

impl EventKind {
    /// All event kinds in pipeline order
    pub const ALL: [EventKind; 5] = [
        EventKind::BidRequest,
        EventKind::BidResponse,
        EventKind::WinNotification,
        EventKind::Impression,
        EventKind::Click,
    ];

    /// Stable snake_case tag, used in results, logs and checkpoint paths
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BidRequest => "bid_request",
            EventKind::BidResponse => "bid_response",
            EventKind::WinNotification => "win_notification",
            EventKind::Impression => "impression",
            EventKind::Click => "click",
        }
    }

    /// Default topic the raw events are read from
    pub fn default_source_topic(&self) -> &'static str {
        match self {
            EventKind::BidRequest => "bid-requests",
            EventKind::BidResponse => "bid-responses",
            EventKind::WinNotification => "wins",
            EventKind::Impression => "impressions",
            EventKind::Click => "clicks",
        }
    }

    /// Default topic the aggregated counts are written to
    pub fn default_sink_topic(&self) -> &'static str {
        match self {
            EventKind::BidRequest => "aggregated-bid-requests",
            EventKind::BidResponse => "aggregated-bid-responses",
            EventKind::WinNotification => "aggregated-wins",
            EventKind::Impression => "aggregated-impressions",
            EventKind::Click => "aggregated-clicks",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common accessors over the five event types
///
/// The processor is generic over this trait: it only needs the event time
/// and the attributes that grouping keys are built from.
pub trait AdEvent: Send + Sync + 'static {
    /// Kind tag of this event type
    const KIND: EventKind;

    /// When the event happened
    fn event_time(&self) -> DateTime<Utc>;

    /// Campaign the event belongs to, if known
    fn campaign_id(&self) -> Option<&str>;

    /// Creative the event refers to, if known
    fn creative_id(&self) -> Option<&str> {
        None
    }
}

/// Auction request received from a supply source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    /// Auction identifier
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
}

/// Bid placed in answer to a bid request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidResponse {
    pub id: String,
    #[serde(default)]
    pub bid_request_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub creative_id: Option<String>,
    /// Bid price in `currency` units (CPM)
    #[serde(default)]
    pub bid_price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Notification that a bid won the auction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinNotification {
    #[serde(default)]
    pub bid_request_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub creative_id: Option<String>,
    /// Clearing price
    #[serde(default)]
    pub win_price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Creative rendered to a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub id: String,
    #[serde(default)]
    pub bid_request_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub creative_id: Option<String>,
}

/// User click on a rendered creative
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Click {
    pub id: String,
    #[serde(default)]
    pub impression_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub creative_id: Option<String>,
    #[serde(default)]
    pub landing_url: Option<String>,
}

impl AdEvent for BidRequest {
    const KIND: EventKind = EventKind::BidRequest;

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }
}

impl AdEvent for BidResponse {
    const KIND: EventKind = EventKind::BidResponse;

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    fn creative_id(&self) -> Option<&str> {
        self.creative_id.as_deref()
    }
}

impl AdEvent for WinNotification {
    const KIND: EventKind = EventKind::WinNotification;

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    fn creative_id(&self) -> Option<&str> {
        self.creative_id.as_deref()
    }
}

impl AdEvent for Impression {
    const KIND: EventKind = EventKind::Impression;

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    fn creative_id(&self) -> Option<&str> {
        self.creative_id.as_deref()
    }
}

impl AdEvent for Click {
    const KIND: EventKind = EventKind::Click;

    fn event_time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    fn creative_id(&self) -> Option<&str> {
        self.creative_id.as_deref()
    }
}
