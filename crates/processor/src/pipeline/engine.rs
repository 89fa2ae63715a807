//! Aggregation engine running one pipeline
//!
//! The engine joins two loops: records flow in from a reader task over a
//! bounded channel, and a clock task sends `Tick` and `Checkpoint` signals.
//! Ticks advance the watermark, fire closed windows and hand the results to
//! the sink. Checkpoint signals snapshot the store for the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::definition::PipelineDefinition;
use crate::core::SourceRecord;
use crate::error::{ProcessorError, Result, SinkError};
use crate::kafka::{RecordSource, ResultSink};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state::{
    CheckpointCoordinator, CheckpointRequest, CheckpointStats, CheckpointStorage,
    WindowStateStore,
};
use crate::watermark::{BoundedOutOfOrdernessWatermark, Watermark, WatermarkGenerator};
use crate::window::{WindowAssigner, WindowKey};
use adstream_types::AggregatedResult;

/// Backoff of the reader task after a failed poll
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Starting,
    Restoring,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Starting => "starting",
            PipelineState::Restoring => "restoring",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Statistics for the aggregation engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Records read from the source
    pub records_received: u64,
    /// Events counted into a window
    pub events_processed: u64,
    /// Events dropped because their window already fired
    pub events_late: u64,
    /// Records that could not be decoded
    pub decode_failures: u64,
    /// Events stamped too far ahead of processing time
    pub events_future: u64,
    /// Events whose window falls outside the representable time range
    pub events_unassignable: u64,
    /// Windows fired by ticks
    pub windows_fired: u64,
    /// Results acknowledged by the sink
    pub results_emitted: u64,
    /// Results dropped because they could not be serialised
    pub results_dropped: u64,
    /// Delivery rounds that exhausted their retries
    pub sink_failures: u64,
    /// Results waiting for the sink
    pub results_pending: u64,
    /// Checkpoint requests handed to the coordinator
    pub checkpoints_requested: u64,
    /// Current watermark timestamp
    pub current_watermark: i64,
    /// Checkpoint the pipeline was restored from
    pub restored_from: Option<u64>,
}

/// Result of feeding one record to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Counted; carries the window's new count
    Counted { window: WindowKey, count: u64 },
    /// Window already fired; not counted
    Late { window: WindowKey },
    /// Payload could not be decoded; skipped
    Malformed,
    /// Event time too far ahead of processing time; skipped
    FutureTimestamp,
    /// No window can hold the event time; skipped
    Unassignable,
}

enum Control {
    Tick,
    Checkpoint,
}

/// Timing and retry settings of an engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    pub checkpoint_interval: Duration,
    pub buffer_size: usize,
    /// Events later than `now + max_future_skew` are rejected
    pub max_future_skew: chrono::Duration,
    pub sink_retry: RetryConfig,
    pub checkpoint_retry: RetryConfig,
}

/// Keyed tumbling-window counter for one event stream
pub struct AggregationEngine<T> {
    definition: PipelineDefinition<T>,
    assigner: Box<dyn WindowAssigner>,
    watermarks: BoundedOutOfOrdernessWatermark,
    store: Arc<WindowStateStore>,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn ResultSink>,
    storage: Arc<dyn CheckpointStorage>,
    coordinator: Option<CheckpointCoordinator>,
    pending: VecDeque<AggregatedResult>,
    settings: EngineSettings,
    state_tx: watch::Sender<PipelineState>,
    stats: EngineStats,
}

impl<T: Send + 'static> AggregationEngine<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        definition: PipelineDefinition<T>,
        assigner: Box<dyn WindowAssigner>,
        watermarks: BoundedOutOfOrdernessWatermark,
        store: WindowStateStore,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn ResultSink>,
        storage: Arc<dyn CheckpointStorage>,
        settings: EngineSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Starting);
        Self {
            definition,
            assigner,
            watermarks,
            store: Arc::new(store),
            source,
            sink,
            storage,
            coordinator: None,
            pending: VecDeque::new(),
            settings,
            state_tx,
            stats: EngineStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.definition.name()
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(pipeline = self.name(), from = %previous, to = %state, "Pipeline state changed");
        }
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.results_pending = self.pending.len() as u64;
        stats.current_watermark = self.watermarks.current_watermark().timestamp;
        stats
    }

    pub fn checkpoint_stats(&self) -> Option<CheckpointStats> {
        self.coordinator.as_ref().map(|c| c.stats())
    }

    pub fn store(&self) -> &WindowStateStore {
        &self.store
    }

    /// Results fired but not yet acknowledged by the sink
    pub fn pending(&self) -> impl Iterator<Item = &AggregatedResult> {
        self.pending.iter()
    }

    pub fn current_watermark(&self) -> Watermark {
        self.watermarks.current_watermark()
    }

    /// Restore from the latest checkpoint, assign the source and start the
    /// checkpoint coordinator. Returns the id of the restored checkpoint.
    pub async fn initialize(&mut self) -> Result<Option<u64>> {
        self.set_state(PipelineState::Starting);

        let latest = self
            .storage
            .load_latest()
            .await
            .and_then(|checkpoint| match checkpoint {
                Some(checkpoint) => Ok(Some((checkpoint.state()?, checkpoint))),
                None => Ok(None),
            });

        let restored = match latest {
            Ok(Some((state, checkpoint))) => {
                self.set_state(PipelineState::Restoring);
                self.store.restore(&state);
                self.watermarks.advance_to(state.watermark);
                self.pending = state.pending.into_iter().collect();

                let id = checkpoint.metadata.checkpoint_id;
                info!(
                    pipeline = self.name(),
                    checkpoint_id = id,
                    windows = self.store.len(),
                    pending = self.pending.len(),
                    watermark = %state.watermark,
                    "Restored from checkpoint"
                );
                Some(id)
            }
            Ok(None) => {
                info!(pipeline = self.name(), "No checkpoint found, starting empty");
                None
            }
            Err(e) => {
                error!(pipeline = self.name(), error = %e, "Checkpoint restore failed");
                self.set_state(PipelineState::Failed);
                return Err(e.into());
            }
        };
        self.stats.restored_from = restored;

        if let Err(e) = self.source.assign(&self.store.offsets()).await {
            self.set_state(PipelineState::Failed);
            return Err(e);
        }

        self.coordinator = Some(CheckpointCoordinator::start(
            self.name(),
            Arc::clone(&self.storage),
            self.settings.checkpoint_retry.clone(),
            Some(Arc::clone(&self.source)),
            restored.map(|id| id + 1).unwrap_or(1),
        ));

        self.set_state(PipelineState::Running);
        Ok(restored)
    }

    /// Decode, key, window and count one record
    pub fn process_record(&mut self, record: SourceRecord) -> RecordOutcome {
        self.process_record_at(record, Utc::now())
    }

    fn process_record_at(&mut self, record: SourceRecord, now: DateTime<Utc>) -> RecordOutcome {
        self.stats.records_received += 1;

        let decoded = match record.payload.as_deref() {
            Some(payload) => self.definition.decoder.decode(payload),
            None => Err(crate::error::DecodeError::EmptyPayload),
        };
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!(
                    target: "dead_letter",
                    pipeline = self.name(),
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable record"
                );
                self.store
                    .record_offset(&record.topic, record.partition, record.offset);
                return RecordOutcome::Malformed;
            }
        };

        let event_time = self.definition.time_extractor.extract_event_time(&event);
        let horizon = now
            .checked_add_signed(self.settings.max_future_skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if event_time > horizon {
            self.stats.events_future += 1;
            self.reject(&record, event_time, "event time too far in the future");
            return RecordOutcome::FutureTimestamp;
        }

        let windows = self.assigner.assign_windows(event_time);
        if windows.is_empty() {
            self.stats.events_unassignable += 1;
            self.reject(&record, event_time, "no window can hold the event time");
            return RecordOutcome::Unassignable;
        }

        let key = self.definition.key_extractor.extract_key(&event);
        self.watermarks
            .on_event(event_time.timestamp_millis(), record.partition, now);

        let mut outcome = RecordOutcome::Unassignable;
        for bounds in windows {
            let window = WindowKey::new(key.clone(), bounds);
            if self.store.is_late(&window.bounds) {
                self.stats.events_late += 1;
                debug!(
                    pipeline = self.name(),
                    window = %window,
                    watermark = %self.store.fired_watermark(),
                    "Dropping event for fired window"
                );
                outcome = RecordOutcome::Late { window };
                continue;
            }

            let count = self.store.accumulate(window.clone(), 1);
            self.stats.events_processed += 1;
            trace!(pipeline = self.name(), window = %window, count, "Event counted");
            outcome = RecordOutcome::Counted { window, count };
        }

        self.store
            .record_offset(&record.topic, record.partition, record.offset);
        outcome
    }

    fn reject(&self, record: &SourceRecord, event_time: DateTime<Utc>, reason: &str) {
        warn!(
            target: "dead_letter",
            pipeline = self.name(),
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            event_time = %event_time,
            reason,
            "Skipping event"
        );
        self.store
            .record_offset(&record.topic, record.partition, record.offset);
    }

    /// Advance the watermark, fire closed windows and deliver results.
    /// Returns the number of windows fired.
    pub async fn on_tick(&mut self, now: DateTime<Utc>) -> usize {
        self.watermarks.on_periodic_check(now);
        let watermark = self.watermarks.current_watermark();

        let fired = self.store.tick(watermark);
        let count = fired.len();
        if count > 0 {
            self.stats.windows_fired += count as u64;
            debug!(pipeline = self.name(), watermark = %watermark, windows = count, "Windows fired");
        }
        let kind = self.definition.kind;
        self.pending
            .extend(fired.into_iter().map(|window| window.into_result(kind)));

        self.emit_pending().await;
        count
    }

    /// Deliver pending results in order; stops at the first result that
    /// still fails after retries. Returns the number delivered.
    pub async fn emit_pending(&mut self) -> usize {
        let mut delivered = 0;

        while let Some(result) = self.pending.front().cloned() {
            let sink = Arc::clone(&self.sink);
            let sent = retry_with_backoff(
                &self.settings.sink_retry,
                "sink_send",
                SinkError::is_retryable,
                |_| {
                    let sink = Arc::clone(&sink);
                    let result = result.clone();
                    async move { sink.send(&result).await }
                },
            )
            .await;

            match sent {
                Ok(()) => {
                    self.pending.pop_front();
                    self.stats.results_emitted += 1;
                    delivered += 1;
                }
                Err(SinkError::Serialization(reason)) => {
                    self.pending.pop_front();
                    self.stats.results_dropped += 1;
                    error!(
                        pipeline = self.name(),
                        window = %result.window_id(),
                        reason = %reason,
                        "Dropping result that cannot be serialised"
                    );
                }
                Err(e) => {
                    self.stats.sink_failures += 1;
                    warn!(
                        pipeline = self.name(),
                        pending = self.pending.len(),
                        error = %e,
                        "Sink unavailable, keeping results pending"
                    );
                    break;
                }
            }
        }

        delivered
    }

    fn checkpoint_request(&self) -> CheckpointRequest {
        CheckpointRequest::new(self.store.snapshot(), self.pending.iter().cloned().collect())
    }

    /// Hand a snapshot to the coordinator without waiting; false when skipped
    pub fn request_checkpoint(&mut self) -> bool {
        let Some(coordinator) = &self.coordinator else {
            return false;
        };
        let request = self.checkpoint_request();
        let version = request.snapshot.version;
        let submitted = coordinator.try_submit(request);
        if submitted {
            self.store.mark_snapshot_taken(version);
            self.stats.checkpoints_requested += 1;
        }
        submitted
    }

    /// Write a checkpoint and wait until it is durable
    pub async fn checkpoint_now(&mut self) -> Result<u64> {
        let request = self.checkpoint_request();
        let version = request.snapshot.version;
        let coordinator = self.coordinator.as_ref().ok_or_else(|| {
            ProcessorError::Unexpected("pipeline is not initialized".to_string())
        })?;
        let id = coordinator.checkpoint_now(request).await?;
        self.store.mark_snapshot_taken(version);
        self.stats.checkpoints_requested += 1;
        Ok(id)
    }

    /// Run until `shutdown` turns true, then stop cleanly
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<EngineStats> {
        if let Err(e) = self.initialize().await {
            error!(pipeline = self.name(), error = %e, "Pipeline failed to start");
            return Err(e);
        }

        let (record_tx, mut record_rx) = mpsc::channel(self.settings.buffer_size.max(1));
        let (control_tx, mut control_rx) = mpsc::channel(2);
        let (stop_tx, stop_rx) = watch::channel(false);

        let reader = tokio::spawn(read_records(
            self.name(),
            Arc::clone(&self.source),
            record_tx,
            stop_rx.clone(),
        ));
        let clock = tokio::spawn(run_clock(
            self.settings.tick_interval,
            self.settings.checkpoint_interval,
            control_tx,
            stop_rx,
        ));

        info!(pipeline = self.name(), "Pipeline running");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(control) = control_rx.recv() => match control {
                    Control::Tick => {
                        self.on_tick(Utc::now()).await;
                    }
                    Control::Checkpoint => {
                        self.request_checkpoint();
                    }
                },
                record = record_rx.recv() => match record {
                    Some(record) => {
                        self.process_record(record);
                    }
                    None => {
                        warn!(pipeline = self.name(), "Record reader stopped unexpectedly");
                        break;
                    }
                },
            }
        }

        self.stop(stop_tx, reader, clock, record_rx).await
    }

    async fn stop(
        mut self,
        stop_tx: watch::Sender<bool>,
        reader: JoinHandle<()>,
        clock: JoinHandle<()>,
        mut record_rx: mpsc::Receiver<SourceRecord>,
    ) -> Result<EngineStats> {
        self.set_state(PipelineState::Stopping);
        let _ = stop_tx.send(true);

        // drain what the reader already handed over
        let mut drained = 0u64;
        while let Some(record) = record_rx.recv().await {
            self.process_record(record);
            drained += 1;
        }
        for (task, handle) in [("reader", reader), ("clock", clock)] {
            if let Err(e) = handle.await {
                error!(pipeline = self.name(), task, "Task panicked: {}", e);
            }
        }

        self.emit_pending().await;

        let mut final_checkpoint = Ok(());
        match self.checkpoint_now().await {
            Ok(id) => info!(
                pipeline = self.name(),
                checkpoint_id = id,
                drained,
                pending = self.pending.len(),
                "Final checkpoint written"
            ),
            Err(e) => {
                error!(pipeline = self.name(), error = %e, "Final checkpoint failed");
                final_checkpoint = Err(e);
            }
        }
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.shutdown().await;
        }

        if let Err(e) = self.source.close().await {
            warn!(pipeline = self.name(), error = %e, "Failed to close source");
        }
        if let Err(e) = self.sink.close().await {
            warn!(pipeline = self.name(), error = %e, "Failed to close sink");
        }

        if let Err(e) = final_checkpoint {
            self.set_state(PipelineState::Failed);
            return Err(e);
        }

        self.set_state(PipelineState::Stopped);
        let stats = self.stats();
        info!(
            pipeline = self.name(),
            processed = stats.events_processed,
            late = stats.events_late,
            malformed = stats.decode_failures,
            rejected = stats.events_future + stats.events_unassignable,
            emitted = stats.results_emitted,
            pending = stats.results_pending,
            "Pipeline stopped"
        );
        Ok(stats)
    }
}

async fn read_records(
    pipeline: &'static str,
    source: Arc<dyn RecordSource>,
    tx: mpsc::Sender<SourceRecord>,
    mut stop: watch::Receiver<bool>,
) {
    while !*stop.borrow() {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            polled = source.poll() => match polled {
                Ok(Some(record)) => {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pipeline, error = %e, "Source poll failed, backing off");
                    time::sleep(POLL_ERROR_BACKOFF).await;
                }
            },
        }
    }
    debug!(pipeline, "Record reader stopped");
}

async fn run_clock(
    tick_interval: Duration,
    checkpoint_interval: Duration,
    tx: mpsc::Sender<Control>,
    mut stop: watch::Receiver<bool>,
) {
    let start = time::Instant::now();
    let mut ticks = time::interval_at(start + tick_interval, tick_interval);
    let mut checkpoints = time::interval_at(start + checkpoint_interval, checkpoint_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    checkpoints.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !*stop.borrow() {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticks.tick() => {
                // a full queue means a tick is already waiting
                let _ = tx.try_send(Control::Tick);
            }
            _ = checkpoints.tick() => {
                let _ = tx.try_send(Control::Checkpoint);
            }
        }
    }
}
