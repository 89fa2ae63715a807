//! Kafka integration for stream processing
//!
//! This module provides the source and sink used by every pipeline.
//!
//! # Features
//!
//! ## KafkaSource (Consumer)
//! - Explicit partition assignment from topic metadata
//! - Resume from checkpointed offsets, falling back to the group's committed offsets
//! - Manual offset commits driven by checkpoints
//!
//! ## KafkaSink (Producer)
//! - JSON results keyed by grouping key, timestamped with the window end
//! - Idempotent producer when `acks=all`
//! - Latency and delivery metrics
//!
//! Both sides sit behind traits ([`RecordSource`], [`ResultSink`]) so the
//! engine can run against in-memory implementations in tests.

pub mod offsets;
pub mod sink;
pub mod source;

pub use offsets::{SourceOffsets, TopicPartition};
pub use sink::{KafkaSink, ResultSink, SinkMetrics};
pub use source::{KafkaSource, KafkaSourceMetrics, RecordSource};
