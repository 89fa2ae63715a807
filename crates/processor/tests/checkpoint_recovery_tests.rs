//! Integration tests for checkpointing, restart and clean shutdown

mod common;

use chrono::{TimeZone, Utc};
use common::*;
use processor::core::GroupingKey;
use processor::pipeline::PipelineState;
use processor::state::{
    Checkpoint, CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage,
};
use processor::window::{WindowBounds, WindowKey};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn first_window(key: &str) -> WindowKey {
    WindowKey::new(
        GroupingKey::from(key),
        WindowBounds::new(
            Utc.timestamp_millis_opt(0).unwrap(),
            Utc.timestamp_millis_opt(60_000).unwrap(),
        ),
    )
}

fn five_requests() -> Vec<processor::core::SourceRecord> {
    (0..5)
        .map(|i| bid_request(i, 1_000 * (i + 1), "camp1"))
        .collect()
}

async fn drain(
    engine: &mut processor::pipeline::AggregationEngine<adstream_types::BidRequest>,
    source: &QueueSource,
) {
    use processor::kafka::RecordSource;
    while source.remaining() > 0 {
        if let Some(record) = source.poll().await.unwrap() {
            engine.process_record(record);
        }
    }
}

#[tokio::test]
async fn test_restart_replays_after_last_checkpoint() {
    let storage = Arc::new(MemoryCheckpointStorage::new(3));

    // first run: checkpoint after two events, then crash after five
    {
        let source = Arc::new(QueueSource::new(five_requests()));
        let mut engine = test_engine(
            source.clone(),
            Arc::new(FlakySink::default()),
            storage.clone(),
        );
        assert_eq!(engine.initialize().await.unwrap(), None);

        use processor::kafka::RecordSource;
        for _ in 0..2 {
            let record = source.poll().await.unwrap().unwrap();
            engine.process_record(record);
        }
        engine.checkpoint_now().await.unwrap();
        drain(&mut engine, &source).await;
        assert_eq!(engine.store().count(&first_window("camp1")), Some(5));
    }

    // second run: restored count 2, replay from offset 2
    let source = Arc::new(QueueSource::new(five_requests()));
    let mut engine = test_engine(
        source.clone(),
        Arc::new(FlakySink::default()),
        storage.clone(),
    );
    let restored = engine.initialize().await.unwrap();
    assert_eq!(restored, Some(1));
    assert_eq!(engine.store().count(&first_window("camp1")), Some(2));
    assert_eq!(source.remaining(), 3);

    drain(&mut engine, &source).await;
    let count = engine.store().count(&first_window("camp1")).unwrap();
    assert!((2..=5).contains(&count));
    assert_eq!(count, 5);
}

#[tokio::test]
async fn test_restored_pipeline_matches_uninterrupted_run() {
    let records: Vec<_> = (0..40)
        .map(|i| bid_request(i, 3_000 * i, &format!("camp{}", i % 3)))
        .collect();

    // uninterrupted
    let sink_a = Arc::new(FlakySink::default());
    let source_a = Arc::new(QueueSource::new(records.clone()));
    let mut engine_a = test_engine(
        source_a.clone(),
        sink_a.clone(),
        Arc::new(MemoryCheckpointStorage::new(3)),
    );
    engine_a.initialize().await.unwrap();
    drain(&mut engine_a, &source_a).await;
    engine_a.on_tick(Utc::now()).await;

    // interrupted after a checkpoint at record 17
    let storage = Arc::new(MemoryCheckpointStorage::new(3));
    let sink_b = Arc::new(FlakySink::default());
    {
        let source = Arc::new(QueueSource::new(records[..17].to_vec()));
        let mut engine = test_engine(source.clone(), sink_b.clone(), storage.clone());
        engine.initialize().await.unwrap();
        drain(&mut engine, &source).await;
        engine.checkpoint_now().await.unwrap();
    }
    let source_b = Arc::new(QueueSource::new(records));
    let mut engine_b = test_engine(source_b.clone(), sink_b.clone(), storage);
    engine_b.initialize().await.unwrap();
    drain(&mut engine_b, &source_b).await;
    engine_b.on_tick(Utc::now()).await;

    assert_eq!(sink_a.delivered(), sink_b.delivered());
    for key in ["camp0", "camp1", "camp2"] {
        let window = WindowKey::new(
            GroupingKey::from(key),
            WindowBounds::new(
                Utc.timestamp_millis_opt(60_000).unwrap(),
                Utc.timestamp_millis_opt(120_000).unwrap(),
            ),
        );
        assert_eq!(engine_a.store().count(&window), engine_b.store().count(&window));
    }
}

#[tokio::test]
async fn test_corrupt_checkpoints_fail_the_pipeline() {
    let dir = std::env::temp_dir().join(format!("adstream_corrupt_{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("checkpoint_00000000000000000001.ckpt"), b"truncated")
        .await
        .unwrap();

    let storage = Arc::new(FileCheckpointStorage::new(&dir, 3));
    let mut engine = test_engine(
        Arc::new(QueueSource::default()),
        Arc::new(FlakySink::default()),
        storage,
    );
    let state = engine.subscribe_state();

    assert!(engine.initialize().await.is_err());
    assert_eq!(*state.borrow(), PipelineState::Failed);

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn test_restore_skips_corrupt_newest_checkpoint() {
    let dir = std::env::temp_dir().join(format!("adstream_fallback_{}", uuid::Uuid::new_v4()));
    let storage = Arc::new(FileCheckpointStorage::new(&dir, 3));

    {
        let source = Arc::new(QueueSource::new(five_requests()));
        let mut engine = test_engine(
            source.clone(),
            Arc::new(FlakySink::default()),
            storage.clone(),
        );
        engine.initialize().await.unwrap();
        drain(&mut engine, &source).await;
        assert_eq!(engine.checkpoint_now().await.unwrap(), 1);
    }
    let newer = Checkpoint::new(2, "bid_requests", &Default::default(), 0).unwrap();
    storage.save(&newer).await.unwrap();
    tokio::fs::write(dir.join("checkpoint_00000000000000000002.ckpt"), b"garbage")
        .await
        .unwrap();

    let mut engine = test_engine(
        Arc::new(QueueSource::new(five_requests())),
        Arc::new(FlakySink::default()),
        storage,
    );
    assert_eq!(engine.initialize().await.unwrap(), Some(1));
    assert_eq!(engine.store().count(&first_window("camp1")), Some(5));

    tokio::fs::remove_dir_all(&dir).await.ok();
}

#[tokio::test]
async fn test_run_loop_fires_windows_and_checkpoints_on_shutdown() {
    let records = vec![
        bid_request(0, 5_000, "camp1"),
        bid_request(1, 30_000, "camp1"),
        garbage(2),
        bid_request(3, 59_000, "camp1"),
        bid_request(4, 61_000, "camp1"),
    ];
    let source = Arc::new(QueueSource::new(records));
    let sink = Arc::new(FlakySink::default());
    let storage = Arc::new(MemoryCheckpointStorage::new(3));

    let engine = test_engine(source.clone(), sink.clone(), storage.clone());
    let state = engine.subscribe_state();
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run(stop_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.delivered().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("window fired");

    stop_tx.send(true).unwrap();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(*state.borrow(), PipelineState::Stopped);
    assert_eq!(stats.events_processed, 4);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.results_emitted, 1);
    assert_eq!(sink.delivered()[0].count, 3);

    // open window and offsets survive in the final checkpoint
    let latest = storage.load_latest().await.unwrap().unwrap();
    let checkpointed = latest.state().unwrap();
    assert_eq!(checkpointed.accumulators.len(), 1);
    assert_eq!(checkpointed.accumulators[0].1.count, 1);
    assert_eq!(checkpointed.offsets.next_offset(TOPIC, 0), Some(5));

    // offsets committed after the checkpoint, source closed
    let committed = source.committed.lock().last().cloned().unwrap();
    assert_eq!(committed.next_offset(TOPIC, 0), Some(5));
    assert!(source.closed.load(Ordering::SeqCst));
}
