//! Integration tests for windowed counting, late data and sink delivery

mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::*;
use processor::config::{WatermarkConfig, WindowConfig};
use processor::core::GroupingKey;
use processor::pipeline::{PipelineState, RecordOutcome};
use processor::state::{CheckpointStorage, MemoryCheckpointStorage};
use processor::window::{WindowBounds, WindowKey};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn window(key: &str, start_ms: i64) -> WindowKey {
    WindowKey::new(
        GroupingKey::from(key),
        WindowBounds::new(
            Utc.timestamp_millis_opt(start_ms).unwrap(),
            Utc.timestamp_millis_opt(start_ms + 60_000).unwrap(),
        ),
    )
}

#[tokio::test]
async fn test_tumbling_window_counts_per_campaign() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine.initialize().await.unwrap();
    assert_eq!(engine.state(), PipelineState::Running);

    for (offset, ts) in [5_000, 30_000, 59_000].into_iter().enumerate() {
        engine.process_record(bid_request(offset as i64, ts, "camp1"));
    }
    assert_eq!(engine.store().count(&window("camp1", 0)), Some(3));

    let outcome = engine.process_record(bid_request(3, 61_000, "camp1"));
    assert_eq!(
        outcome,
        RecordOutcome::Counted {
            window: window("camp1", 60_000),
            count: 1
        }
    );

    assert_eq!(engine.on_tick(Utc::now()).await, 1);

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].key, "camp1");
    assert_eq!(delivered[0].window_start.timestamp_millis(), 0);
    assert_eq!(delivered[0].window_end.timestamp_millis(), 60_000);
    assert_eq!(delivered[0].count, 3);

    // second window still open
    assert_eq!(engine.store().count(&window("camp1", 60_000)), Some(1));
}

#[tokio::test]
async fn test_results_ordered_by_window_then_key() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 70_000, "camp2"));
    engine.process_record(bid_request(1, 10_000, "camp2"));
    engine.process_record(bid_request(2, 20_000, "camp1"));
    engine.process_record(bid_request(3, 65_000, "camp1"));
    engine.process_record(bid_request(4, 125_000, "camp9"));

    assert_eq!(engine.on_tick(Utc::now()).await, 4);

    let fired: Vec<(i64, String)> = sink
        .delivered()
        .into_iter()
        .map(|r| (r.window_start.timestamp_millis(), r.key))
        .collect();
    assert_eq!(
        fired,
        vec![
            (0, "camp1".to_string()),
            (0, "camp2".to_string()),
            (60_000, "camp1".to_string()),
            (60_000, "camp2".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_missing_campaign_counts_under_unknown() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine.initialize().await.unwrap();

    let payload = serde_json::to_vec(&serde_json::json!({
        "id": "req-1",
        "timestamp": 1_000
    }))
    .unwrap();
    engine.process_record(processor::core::SourceRecord::new(TOPIC, 0, 0, payload));

    assert_eq!(engine.store().count(&window("unknown", 0)), Some(1));
}

#[tokio::test]
async fn test_malformed_message_does_not_block_later_events() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 1_000, "camp1"));
    assert_eq!(engine.process_record(garbage(1)), RecordOutcome::Malformed);
    engine.process_record(bid_request(2, 2_000, "camp1"));

    let stats = engine.stats();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.events_processed, 2);
    assert_eq!(engine.store().count(&window("camp1", 0)), Some(2));
    assert_eq!(engine.store().offsets().next_offset(TOPIC, 0), Some(3));
}

#[tokio::test]
async fn test_allowed_lateness_keeps_window_open() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_builder(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    )
    .with_window(WindowConfig {
        allowed_lateness_ms: 5_000,
        ..WindowConfig::tumbling(60_000)
    })
    .build()
    .unwrap();
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 10_000, "camp1"));
    engine.process_record(bid_request(1, 62_000, "camp1"));
    assert_eq!(engine.on_tick(Utc::now()).await, 0);

    // within lateness: still counted
    engine.process_record(bid_request(2, 20_000, "camp1"));

    engine.process_record(bid_request(3, 70_000, "camp1"));
    assert_eq!(engine.on_tick(Utc::now()).await, 1);
    assert_eq!(sink.delivered()[0].count, 2);

    // beyond lateness: dropped
    let outcome = engine.process_record(bid_request(4, 30_000, "camp1"));
    assert!(matches!(outcome, RecordOutcome::Late { .. }));
    assert_eq!(engine.stats().events_late, 1);
}

#[tokio::test]
async fn test_idle_stream_fires_with_processing_time() {
    let sink = Arc::new(FlakySink::default());
    let mut engine = test_builder(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    )
    .with_watermark(WatermarkConfig {
        max_delay_ms: 5_000,
        idle_timeout_ms: 1_000,
        idle_advance: true,
        ..Default::default()
    })
    .build()
    .unwrap();
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 5_000, "camp1"));
    assert_eq!(engine.on_tick(Utc::now()).await, 0);

    let later = Utc::now() + ChronoDuration::seconds(5);
    assert_eq!(engine.on_tick(later).await, 1);
    assert_eq!(sink.delivered()[0].count, 1);
}

#[tokio::test]
async fn test_sink_failing_twice_delivers_once() {
    let sink = Arc::new(FlakySink::failing(2));
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 5_000, "camp1"));
    engine.process_record(bid_request(1, 61_000, "camp1"));
    engine.on_tick(Utc::now()).await;

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sink.delivered().len(), 1);
    assert_eq!(engine.pending().count(), 0);
    assert_eq!(engine.stats().results_emitted, 1);
    assert_eq!(engine.state(), PipelineState::Running);
}

#[tokio::test]
async fn test_exhausted_sink_retries_keep_results_pending() {
    let sink = Arc::new(FlakySink::failing(100));
    let storage = Arc::new(MemoryCheckpointStorage::new(3));
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        sink.clone(),
        storage.clone(),
    );
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, 5_000, "camp1"));
    engine.process_record(bid_request(1, 6_000, "camp2"));
    engine.process_record(bid_request(2, 61_000, "camp1"));
    assert_eq!(engine.on_tick(Utc::now()).await, 2);

    assert!(sink.delivered().is_empty());
    assert_eq!(engine.pending().count(), 2);
    assert_eq!(engine.stats().sink_failures, 1);

    // pending results survive in the checkpoint
    engine.checkpoint_now().await.unwrap();
    let latest = storage.load_latest().await.unwrap().unwrap();
    assert_eq!(latest.state().unwrap().pending.len(), 2);

    // sink recovers; the next tick drains the backlog in order
    sink.failures.store(0, Ordering::SeqCst);
    engine.on_tick(Utc::now()).await;

    let keys: Vec<String> = sink.delivered().into_iter().map(|r| r.key).collect();
    assert_eq!(keys, vec!["camp1".to_string(), "camp2".to_string()]);
    assert_eq!(engine.pending().count(), 0);
}

#[tokio::test]
async fn test_future_stamped_event_survives_restart_without_firing() {
    let sink = Arc::new(FlakySink::default());
    let storage = Arc::new(MemoryCheckpointStorage::new(3));
    let now = Utc::now().timestamp_millis();
    let skewed = WatermarkConfig {
        max_delay_ms: 0,
        idle_timeout_ms: 60_000,
        idle_advance: false,
        max_future_skew_ms: 60_000,
    };

    let mut engine = test_builder(Arc::new(QueueSource::default()), sink.clone(), storage.clone())
        .with_watermark(skewed.clone())
        .build()
        .unwrap();
    engine.initialize().await.unwrap();

    engine.process_record(bid_request(0, now, "camp1"));
    let outcome = engine.process_record(bid_request(1, now + 3_600_000, "camp1"));
    assert_eq!(outcome, RecordOutcome::FutureTimestamp);
    engine.on_tick(Utc::now()).await;
    engine.checkpoint_now().await.unwrap();
    assert!(sink.delivered().is_empty());

    let mut restarted = test_builder(Arc::new(QueueSource::default()), sink.clone(), storage)
        .with_watermark(skewed)
        .build()
        .unwrap();
    restarted.initialize().await.unwrap();
    let outcome = restarted.process_record(bid_request(2, now + 1, "camp1"));
    assert!(matches!(outcome, RecordOutcome::Counted { .. }));
    assert_eq!(restarted.stats().events_late, 0);
    assert_eq!(restarted.store().offsets().next_offset(TOPIC, 0), Some(3));
}
