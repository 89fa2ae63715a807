//! Kafka source consumer
//!
//! Each pipeline owns one consumer reading a single topic. Partitions are
//! assigned explicitly from topic metadata so that checkpointed offsets can
//! be applied before the first fetch. Offsets are committed to the consumer
//! group only after the checkpoint covering them has been written.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::offsets::SourceOffsets;
use crate::config::KafkaConfig;
use crate::core::SourceRecord;
use crate::error::{ProcessorError, Result};

/// A partitioned, replayable stream of raw records
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Start reading; partitions with a known offset resume from it
    async fn assign(&self, offsets: &SourceOffsets) -> Result<()>;

    /// Next record, or `None` when nothing arrived within the poll timeout
    async fn poll(&self) -> Result<Option<SourceRecord>>;

    /// Record `offsets` as the durable read position
    async fn commit(&self, offsets: &SourceOffsets) -> Result<()>;

    /// Stop reading and release the assignment
    async fn close(&self) -> Result<()>;
}

/// Metrics tracked by the Kafka source
#[derive(Debug, Default)]
pub struct KafkaSourceMetrics {
    /// Total messages consumed
    pub messages_consumed: AtomicU64,
    /// Total poll errors
    pub poll_errors: AtomicU64,
    /// Total bytes consumed
    pub bytes_consumed: AtomicU64,
    /// Successful offset commits
    pub total_commits: AtomicU64,
    /// Failed offset commits
    pub commit_failures: AtomicU64,
}

/// Custom consumer context for handling callbacks
struct SourceConsumerContext {
    metrics: Arc<KafkaSourceMetrics>,
}

impl ClientContext for SourceConsumerContext {}

impl ConsumerContext for SourceConsumerContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                self.metrics.total_commits.fetch_add(1, Ordering::Relaxed);
                debug!(partitions = offsets.count(), "Offsets committed");
            }
            Err(err) => {
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                error!("Commit callback error: {}", err);
            }
        }
    }
}

/// Kafka consumer for one pipeline's source topic
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<SourceConsumerContext>>,
    topic: String,
    config: KafkaConfig,
    metrics: Arc<KafkaSourceMetrics>,
    closed: AtomicBool,
}

impl KafkaSource {
    /// Create a consumer for `topic`
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use processor::config::KafkaConfig;
    /// use processor::kafka::{KafkaSource, RecordSource, SourceOffsets};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let source = KafkaSource::new(&KafkaConfig::default(), "bid-requests")?;
    ///     source.assign(&SourceOffsets::new()).await?;
    ///
    ///     while let Some(record) = source.poll().await? {
    ///         println!("{}:{} @ {}", record.topic, record.partition, record.offset);
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: &KafkaConfig, topic: impl Into<String>) -> Result<Self> {
        let metrics = Arc::new(KafkaSourceMetrics::default());
        let context = SourceConsumerContext {
            metrics: metrics.clone(),
        };

        let consumer = Self::create_consumer(config, context)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.into(),
            config: config.clone(),
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Create the underlying Kafka consumer
    fn create_consumer(
        config: &KafkaConfig,
        context: SourceConsumerContext,
    ) -> Result<StreamConsumer<SourceConsumerContext>> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "false") // committed after checkpoints
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        // Apply extra configuration
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }

        client_config
            .create_with_context(context)
            .map_err(|e| ProcessorError::Configuration {
                source: Box::new(e),
            })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metrics(&self) -> &KafkaSourceMetrics {
        &self.metrics
    }

    /// Partition ids of the source topic
    async fn partitions(&self) -> Result<Vec<i32>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let timeout = self.config.metadata_timeout();

        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&topic), timeout)
        })
        .await
        .map_err(|e| ProcessorError::Execution {
            source: Box::new(e),
        })??;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == self.topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();

        if partitions.is_empty() {
            return Err(ProcessorError::config(format!(
                "topic '{}' has no partitions or does not exist",
                self.topic
            )));
        }
        Ok(partitions)
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn assign(&self, offsets: &SourceOffsets) -> Result<()> {
        let partitions = self.partitions().await?;

        let mut tpl = TopicPartitionList::new();
        for &partition in &partitions {
            let offset = offsets
                .next_offset(&self.topic, partition)
                .map(Offset::Offset)
                .unwrap_or(Offset::Stored);
            tpl.add_partition_offset(&self.topic, partition, offset)?;
        }

        self.consumer.assign(&tpl)?;
        info!(
            topic = %self.topic,
            partitions = ?partitions,
            restored = offsets.len(),
            "Assigned source partitions"
        );
        Ok(())
    }

    async fn poll(&self) -> Result<Option<SourceRecord>> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let received =
            match tokio::time::timeout(self.config.poll_timeout(), self.consumer.recv()).await {
                Ok(received) => received,
                Err(_) => return Ok(None),
            };

        match received {
            Ok(msg) => {
                let payload = msg.payload().map(|p| p.to_vec());
                let size = payload.as_ref().map(|p| p.len()).unwrap_or(0);
                self.metrics.messages_consumed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .bytes_consumed
                    .fetch_add(size as u64, Ordering::Relaxed);

                Ok(Some(SourceRecord {
                    payload,
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    timestamp: msg.timestamp().to_millis(),
                }))
            }
            Err(KafkaError::PartitionEOF(_)) => Ok(None),
            Err(e) => {
                self.metrics.poll_errors.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %self.topic, error = %e, "Error polling message");
                Err(e.into())
            }
        }
    }

    async fn commit(&self, offsets: &SourceOffsets) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (tp, next) in offsets.iter().filter(|(tp, _)| tp.topic == self.topic) {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next))?;
        }
        if tpl.count() == 0 {
            return Ok(());
        }

        self.consumer.commit(&tpl, CommitMode::Async)?;
        debug!(topic = %self.topic, partitions = tpl.count(), "Committing checkpointed offsets");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.consumer.unassign()?;
        info!(topic = %self.topic, "Kafka source closed");
        Ok(())
    }
}
