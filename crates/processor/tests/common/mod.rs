//! In-memory source and sink used by the integration tests

#![allow(dead_code)]

use adstream_types::AggregatedResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use processor::config::{EngineConfig, StateBackend, StateConfig, WatermarkConfig, WindowConfig};
use processor::core::SourceRecord;
use processor::decode::gzip_json;
use processor::error::{Result, SinkError, SinkResult};
use processor::kafka::{RecordSource, ResultSink, SourceOffsets};
use processor::pipeline::{AggregationEngine, PipelineBuilder, PipelineDefinition};
use processor::retry::RetryConfig;
use processor::state::CheckpointStorage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "bid-requests";

/// Replayable record queue; `assign` skips records before the given offsets
#[derive(Default)]
pub struct QueueSource {
    log: Vec<SourceRecord>,
    queue: Mutex<VecDeque<SourceRecord>>,
    pub committed: Mutex<Vec<SourceOffsets>>,
    pub closed: AtomicBool,
}

impl QueueSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            queue: Mutex::new(records.iter().cloned().collect()),
            log: records,
            ..Default::default()
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl RecordSource for QueueSource {
    async fn assign(&self, offsets: &SourceOffsets) -> Result<()> {
        let resumed = self
            .log
            .iter()
            .filter(|r| {
                offsets
                    .next_offset(&r.topic, r.partition)
                    .map_or(true, |next| r.offset >= next)
            })
            .cloned()
            .collect();
        *self.queue.lock() = resumed;
        Ok(())
    }

    async fn poll(&self) -> Result<Option<SourceRecord>> {
        let next = self.queue.lock().pop_front();
        if next.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(next)
    }

    async fn commit(&self, offsets: &SourceOffsets) -> Result<()> {
        self.committed.lock().push(offsets.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink failing the first `failures` sends
#[derive(Default)]
pub struct FlakySink {
    pub failures: AtomicU32,
    pub attempts: AtomicU32,
    pub results: Mutex<Vec<AggregatedResult>>,
}

impl FlakySink {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    pub fn delivered(&self) -> Vec<AggregatedResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn send(&self, result: &AggregatedResult) -> SinkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SinkError::Delivery {
                topic: "aggregated-bid-requests".to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.results.lock().push(result.clone());
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }

    async fn close(&self) -> SinkResult<()> {
        Ok(())
    }
}

/// Gzip JSON bid request at `ts_ms` for `campaign`
pub fn bid_request(offset: i64, ts_ms: i64, campaign: &str) -> SourceRecord {
    let payload = gzip_json(&serde_json::json!({
        "id": format!("req-{}", offset),
        "timestamp": ts_ms,
        "campaignId": campaign,
        "country": "DE"
    }))
    .expect("gzip payload");
    SourceRecord::new(TOPIC, 0, offset, payload)
}

pub fn garbage(offset: i64) -> SourceRecord {
    SourceRecord::new(TOPIC, 0, offset, b"\x1f\x8bnot gzip at all".to_vec())
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

/// 60 s windows, no lateness, watermark equal to the highest event time
pub fn test_builder(
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn ResultSink>,
    storage: Arc<dyn CheckpointStorage>,
) -> PipelineBuilder<adstream_types::BidRequest> {
    PipelineBuilder::new(PipelineDefinition::bid_requests(1024 * 1024))
        .with_window(WindowConfig::tumbling(60_000))
        .with_watermark(WatermarkConfig {
            max_delay_ms: 0,
            idle_timeout_ms: 60_000,
            idle_advance: false,
            ..Default::default()
        })
        .with_state(StateConfig {
            backend: StateBackend::Memory,
            storage_path: None,
            checkpoint_interval_ms: 60_000,
            retry: fast_retry(3),
            ..Default::default()
        })
        .with_engine(EngineConfig {
            tick_interval_ms: 10,
            sink_retry: fast_retry(3),
            ..Default::default()
        })
        .with_source(source)
        .with_sink(sink)
        .with_checkpoint_storage(storage)
}

/// Route engine logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_engine(
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn ResultSink>,
    storage: Arc<dyn CheckpointStorage>,
) -> AggregationEngine<adstream_types::BidRequest> {
    init_tracing();
    test_builder(source, sink, storage)
        .build()
        .expect("valid test pipeline")
}
