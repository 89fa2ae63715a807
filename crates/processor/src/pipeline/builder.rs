//! Pipeline builder for fluent configuration
//!
//! Wires a [`PipelineDefinition`] to its source, sink and checkpoint storage and
//! produces a ready-to-run [`AggregationEngine`].

use std::sync::Arc;

use super::engine::{AggregationEngine, EngineSettings};
use super::definition::PipelineDefinition;
use crate::config::{
    EngineConfig, ProcessorConfig, StateBackend, StateConfig, WatermarkConfig, WindowConfig,
};
use crate::error::{ProcessorError, Result};
use crate::kafka::{RecordSource, ResultSink};
use crate::state::{
    CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage, WindowStateStore,
};
use crate::watermark::BoundedOutOfOrdernessWatermark;
use crate::window::TumblingWindowAssigner;

/// Builder for constructing an aggregation pipeline
///
/// # Example
///
/// ```rust,no_run
/// use processor::config::{KafkaConfig, WindowConfig};
/// use processor::kafka::{KafkaSink, KafkaSource};
/// use processor::pipeline::{PipelineBuilder, PipelineDefinition};
/// use std::sync::Arc;
///
/// # fn example() -> anyhow::Result<()> {
/// let kafka = KafkaConfig::default();
/// let engine = PipelineBuilder::new(PipelineDefinition::bid_requests(4 * 1024 * 1024))
///     .with_window(WindowConfig::tumbling(60_000))
///     .with_source(Arc::new(KafkaSource::new(&kafka, "bid-requests")?))
///     .with_sink(Arc::new(KafkaSink::new(&kafka, "aggregated-bid-requests")?))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder<T> {
    definition: PipelineDefinition<T>,
    window: WindowConfig,
    watermark: WatermarkConfig,
    state: StateConfig,
    engine: EngineConfig,
    source: Option<Arc<dyn RecordSource>>,
    sink: Option<Arc<dyn ResultSink>>,
    storage: Option<Arc<dyn CheckpointStorage>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Create a builder with default configuration
    pub fn new(definition: PipelineDefinition<T>) -> Self {
        Self {
            definition,
            window: WindowConfig::default(),
            watermark: WatermarkConfig::default(),
            state: StateConfig::default(),
            engine: EngineConfig::default(),
            source: None,
            sink: None,
            storage: None,
        }
    }

    /// Take window, watermark, state and engine settings from `config`
    pub fn from_config(definition: PipelineDefinition<T>, config: &ProcessorConfig) -> Self {
        Self::new(definition)
            .with_window(config.window.clone())
            .with_watermark(config.watermark.clone())
            .with_state(config.state.clone())
            .with_engine(config.engine.clone())
    }

    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    pub fn with_watermark(mut self, watermark: WatermarkConfig) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_state(mut self, state: StateConfig) -> Self {
        self.state = state;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `storage` instead of the one derived from the state config
    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Checkpoint storage for the pipeline as described by the state config
    fn default_storage(&self) -> Result<Arc<dyn CheckpointStorage>> {
        let retention = self.state.checkpoint_retention;
        match self.state.backend {
            StateBackend::Memory => Ok(Arc::new(MemoryCheckpointStorage::new(retention))),
            StateBackend::FileSystem => {
                let root = self.state.storage_path.as_ref().ok_or_else(|| {
                    ProcessorError::config("file_system state backend requires storage_path")
                })?;
                Ok(Arc::new(FileCheckpointStorage::new(
                    root.join(self.definition.name()),
                    retention,
                )))
            }
        }
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<AggregationEngine<T>> {
        self.window.validate()?;
        self.watermark.validate()?;
        self.state.validate()?;
        self.engine.validate()?;

        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => self.default_storage()?,
        };
        let source = self.source.ok_or_else(|| {
            ProcessorError::config(format!("pipeline {} has no source", self.definition.name()))
        })?;
        let sink = self.sink.ok_or_else(|| {
            ProcessorError::config(format!("pipeline {} has no sink", self.definition.name()))
        })?;

        let assigner =
            TumblingWindowAssigner::new(self.window.size()).with_offset(self.window.offset());

        let watermarks = BoundedOutOfOrdernessWatermark::new(
            self.watermark.max_delay(),
            Some(self.watermark.idle_timeout()),
        )
        .with_idle_advance(self.watermark.idle_advance);

        let store = WindowStateStore::new(self.state.shards, self.window.allowed_lateness());

        let settings = EngineSettings {
            tick_interval: self.engine.tick_interval(),
            checkpoint_interval: self.state.checkpoint_interval(),
            buffer_size: self.engine.buffer_size,
            max_future_skew: self.watermark.max_future_skew(),
            sink_retry: self.engine.sink_retry.clone(),
            checkpoint_retry: self.state.retry.clone(),
        };

        Ok(AggregationEngine::new(
            self.definition,
            Box::new(assigner),
            watermarks,
            store,
            source,
            sink,
            storage,
            settings,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceRecord;
    use crate::error::SinkResult;
    use crate::kafka::SourceOffsets;
    use crate::pipeline::PipelineState;
    use adstream_types::AggregatedResult;
    use async_trait::async_trait;

    struct IdleSource;

    #[async_trait]
    impl RecordSource for IdleSource {
        async fn assign(&self, _offsets: &SourceOffsets) -> Result<()> {
            Ok(())
        }
        async fn poll(&self) -> Result<Option<SourceRecord>> {
            Ok(None)
        }
        async fn commit(&self, _offsets: &SourceOffsets) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct DropSink;

    #[async_trait]
    impl ResultSink for DropSink {
        async fn send(&self, _result: &AggregatedResult) -> SinkResult<()> {
            Ok(())
        }
        async fn flush(&self) -> SinkResult<()> {
            Ok(())
        }
        async fn close(&self) -> SinkResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_requires_source_and_sink() {
        let result = PipelineBuilder::new(PipelineDefinition::clicks(1024))
            .with_sink(Arc::new(DropSink))
            .build();
        assert!(matches!(result, Err(ProcessorError::Configuration { .. })));
    }

    #[test]
    fn test_build_rejects_invalid_window() {
        let result = PipelineBuilder::new(PipelineDefinition::clicks(1024))
            .with_window(WindowConfig::tumbling(0))
            .with_source(Arc::new(IdleSource))
            .with_sink(Arc::new(DropSink))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_memory_backend() {
        let engine = PipelineBuilder::new(PipelineDefinition::wins(1024))
            .with_state(StateConfig {
                backend: StateBackend::Memory,
                storage_path: None,
                ..Default::default()
            })
            .with_source(Arc::new(IdleSource))
            .with_sink(Arc::new(DropSink))
            .build()
            .unwrap();

        assert_eq!(engine.name(), "wins");
        assert_eq!(engine.state(), PipelineState::Starting);
    }

    #[test]
    fn test_build_rejects_oversized_lateness() {
        let result = PipelineBuilder::new(PipelineDefinition::clicks(1024))
            .with_window(WindowConfig {
                allowed_lateness_ms: u64::MAX,
                ..WindowConfig::tumbling(60_000)
            })
            .with_source(Arc::new(IdleSource))
            .with_sink(Arc::new(DropSink))
            .build();
        assert!(matches!(result, Err(ProcessorError::Configuration { .. })));

        let result = PipelineBuilder::new(PipelineDefinition::clicks(1024))
            .with_window(WindowConfig::tumbling(u64::MAX))
            .with_source(Arc::new(IdleSource))
            .with_sink(Arc::new(DropSink))
            .build();
        assert!(matches!(result, Err(ProcessorError::Configuration { .. })));
    }

    #[test]
    fn test_file_backend_requires_path() {
        let result = PipelineBuilder::new(PipelineDefinition::wins(1024))
            .with_state(StateConfig {
                backend: StateBackend::FileSystem,
                storage_path: None,
                ..Default::default()
            })
            .with_source(Arc::new(IdleSource))
            .with_sink(Arc::new(DropSink))
            .build();
        assert!(result.is_err());
    }
}
