//! Stream processor for ad-exchange event aggregation
//!
//! This crate counts ad-exchange events per grouping key over tumbling
//! event-time windows and publishes the counts to Kafka. Window state is
//! checkpointed so that a restarted processor resumes where it stopped with
//! at-least-once semantics.

pub mod config;
pub mod core;
pub mod decode;
pub mod error;
pub mod kafka;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use core::{
    AdEventTimeExtractor, CampaignCreativeKeyExtractor, CampaignKeyExtractor, EventTimeExtractor,
    FnKeyExtractor, GroupingKey, KeyExtractor, SourceRecord,
};

pub use window::{TumblingWindowAssigner, WindowAssigner, WindowBounds, WindowKey};

pub use error::{
    DecodeError, ProcessorError, Result as ProcessorResult, SinkError, StateError,
};

pub use config::{
    EngineConfig, KafkaConfig, PipelineConfig, PipelinesConfig, ProcessorConfig, StateBackend,
    StateConfig, WatermarkConfig, WindowConfig,
};

pub use pipeline::{
    AggregationEngine, AggregatorRuntime, EngineStats, PipelineBuilder, PipelineDefinition,
    PipelineState, RecordOutcome, RuntimeReport,
};

pub use kafka::{KafkaSink, KafkaSource, RecordSource, ResultSink, SourceOffsets, TopicPartition};

pub use state::{
    Checkpoint, CheckpointCoordinator, CheckpointStorage, FileCheckpointStorage,
    MemoryCheckpointStorage, WindowStateStore,
};

pub use retry::RetryConfig;
pub use watermark::{BoundedOutOfOrdernessWatermark, Watermark, WatermarkGenerator};
