//! Kafka sink for publishing aggregated window results
//!
//! Results are JSON documents keyed by the grouping key; the record timestamp
//! is the window end. A send is a single attempt bounded by the send timeout.
//! Retries and buffering are left to the caller so that a result is never
//! reported delivered before the broker acknowledged it.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::error::{ProcessorError, Result, SinkError, SinkResult};
use adstream_types::AggregatedResult;

/// Destination for fired window results
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one result; `Ok` means acknowledged
    async fn send(&self, result: &AggregatedResult) -> SinkResult<()>;

    /// Wait for outstanding deliveries
    async fn flush(&self) -> SinkResult<()>;

    /// Flush and release the producer
    async fn close(&self) -> SinkResult<()>;
}

/// Sink metrics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkMetrics {
    /// Results acknowledged by the broker
    pub messages_sent: u64,
    /// Failed send attempts
    pub messages_failed: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Average acknowledgement latency in microseconds
    pub avg_latency_us: u64,
}

#[derive(Debug, Default)]
struct MetricsTracker {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    total_latency_us: AtomicU64,
}

impl MetricsTracker {
    fn record_success(&self, latency_us: u64, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SinkMetrics {
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);
        SinkMetrics {
            messages_sent: sent,
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            avg_latency_us: if sent > 0 { total_latency / sent } else { 0 },
        }
    }
}

/// Kafka producer writing results of one pipeline to its sink topic
pub struct KafkaSink {
    producer: Arc<FutureProducer>,
    topic: String,
    config: KafkaConfig,
    metrics: Arc<MetricsTracker>,
    shutdown: AtomicBool,
}

impl KafkaSink {
    /// Create a producer for `topic`
    pub fn new(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", format!("{}-{}", config.group_id, topic))
            .set("compression.type", &config.compression_type)
            .set("acks", &config.acks)
            .set("message.timeout.ms", config.send_timeout_ms.to_string());

        if config.acks == "all" {
            client_config.set("enable.idempotence", "true");
        }

        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| ProcessorError::Configuration {
                    source: Box::new(e),
                })?;

        Ok(Self {
            producer: Arc::new(producer),
            topic,
            config: config.clone(),
            metrics: Arc::new(MetricsTracker::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get current metrics
    pub fn metrics(&self) -> SinkMetrics {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl ResultSink for KafkaSink {
    async fn send(&self, result: &AggregatedResult) -> SinkResult<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SinkError::Closed);
        }

        let payload =
            serde_json::to_vec(result).map_err(|e| SinkError::Serialization(e.to_string()))?;

        let record = FutureRecord::to(&self.topic)
            .key(result.key.as_str())
            .payload(&payload)
            .timestamp(result.window_end.timestamp_millis());

        let start = Instant::now();
        match self
            .producer
            .send(record, Timeout::After(self.config.send_timeout()))
            .await
        {
            Ok((partition, offset)) => {
                self.metrics
                    .record_success(start.elapsed().as_micros() as u64, payload.len() as u64);
                debug!(
                    topic = %self.topic,
                    key = %result.key,
                    partition,
                    offset,
                    "Result delivered"
                );
                Ok(())
            }
            Err((err, _)) => {
                self.metrics.record_failure();
                Err(SinkError::Delivery {
                    topic: self.topic.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn flush(&self) -> SinkResult<()> {
        self.producer
            .flush(Timeout::After(self.config.send_timeout()))
            .map_err(|e| SinkError::Delivery {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> SinkResult<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.flush().await {
            error!(topic = %self.topic, "Failed to flush during shutdown: {}", e);
        }

        let metrics = self.metrics();
        info!(
            topic = %self.topic,
            sent = metrics.messages_sent,
            failed = metrics.messages_failed,
            avg_latency_us = metrics.avg_latency_us,
            "Kafka sink shut down"
        );
        Ok(())
    }
}
