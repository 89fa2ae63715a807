//! Per-stream capability sets
//!
//! The five pipelines run the same engine and differ only in the event type,
//! the decoder and how the grouping key is built.

use std::sync::Arc;

use crate::core::{
    AdEventTimeExtractor, CampaignCreativeKeyExtractor, CampaignKeyExtractor, EventTimeExtractor,
    KeyExtractor,
};
use crate::decode::{EventDecoder, GzipJsonDecoder};
use adstream_types::{
    AdEvent, BidRequest, BidResponse, Click, EventKind, Impression, WinNotification,
};

/// Name of the pipeline for `kind`, as used in configuration and checkpoint paths
pub fn pipeline_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::BidRequest => "bid_requests",
        EventKind::BidResponse => "bid_responses",
        EventKind::WinNotification => "wins",
        EventKind::Impression => "impressions",
        EventKind::Click => "clicks",
    }
}

/// Decoder, key and event-time extraction for one event type
pub struct PipelineDefinition<T> {
    pub kind: EventKind,
    pub decoder: Arc<dyn EventDecoder<T>>,
    pub key_extractor: Arc<dyn KeyExtractor<T>>,
    pub time_extractor: Arc<dyn EventTimeExtractor<T>>,
}

impl<T> Clone for PipelineDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            decoder: Arc::clone(&self.decoder),
            key_extractor: Arc::clone(&self.key_extractor),
            time_extractor: Arc::clone(&self.time_extractor),
        }
    }
}

impl<T> PipelineDefinition<T> {
    pub fn name(&self) -> &'static str {
        pipeline_name(self.kind)
    }

    /// Replace the key extractor
    pub fn with_key_extractor(mut self, extractor: impl KeyExtractor<T> + 'static) -> Self {
        self.key_extractor = Arc::new(extractor);
        self
    }

    /// Replace the decoder
    pub fn with_decoder(mut self, decoder: impl EventDecoder<T> + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }
}

impl<T> PipelineDefinition<T>
where
    T: AdEvent + serde::de::DeserializeOwned,
{
    fn gzip_json(key_extractor: Arc<dyn KeyExtractor<T>>, max_payload_bytes: usize) -> Self {
        Self {
            kind: T::KIND,
            decoder: Arc::new(GzipJsonDecoder::<T>::new(max_payload_bytes)),
            key_extractor,
            time_extractor: Arc::new(AdEventTimeExtractor),
        }
    }
}

impl PipelineDefinition<BidRequest> {
    /// Bid requests counted per campaign
    pub fn bid_requests(max_payload_bytes: usize) -> Self {
        Self::gzip_json(Arc::new(CampaignKeyExtractor), max_payload_bytes)
    }
}

impl PipelineDefinition<BidResponse> {
    /// Bid responses counted per campaign and creative
    pub fn bid_responses(max_payload_bytes: usize) -> Self {
        Self::gzip_json(Arc::new(CampaignCreativeKeyExtractor), max_payload_bytes)
    }
}

impl PipelineDefinition<WinNotification> {
    /// Wins counted per campaign and creative
    pub fn wins(max_payload_bytes: usize) -> Self {
        Self::gzip_json(Arc::new(CampaignCreativeKeyExtractor), max_payload_bytes)
    }
}

impl PipelineDefinition<Impression> {
    /// Impressions counted per campaign and creative
    pub fn impressions(max_payload_bytes: usize) -> Self {
        Self::gzip_json(Arc::new(CampaignCreativeKeyExtractor), max_payload_bytes)
    }
}

impl PipelineDefinition<Click> {
    /// Clicks counted per campaign and creative
    pub fn clicks(max_payload_bytes: usize) -> Self {
        Self::gzip_json(Arc::new(CampaignCreativeKeyExtractor), max_payload_bytes)
    }
}
