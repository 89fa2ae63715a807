//! Checkpointing and recovery for window state
//!
//! A checkpoint captures every open window accumulator, the next source
//! offset per partition, the last fired watermark and the results still
//! waiting for the sink. Checkpoints are written by a background coordinator
//! so that serialisation and I/O never stall the engine loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{StoreSnapshot, WindowAccumulator};
use crate::error::{StateError, StateResult};
use crate::kafka::{RecordSource, SourceOffsets};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::watermark::Watermark;
use crate::window::WindowKey;
use adstream_types::AggregatedResult;

/// Version of the checkpoint file format
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Serialisable state captured by a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Open window accumulators, sorted by window then key
    pub accumulators: Vec<(WindowKey, WindowAccumulator)>,
    /// Next offset to read per topic-partition
    pub offsets: SourceOffsets,
    /// Highest watermark windows were fired for
    pub watermark: Watermark,
    /// Fired results not yet acknowledged by the sink
    pub pending: Vec<AggregatedResult>,
    /// Store version at snapshot time
    pub version: u64,
}

/// Checkpoint metadata
///
/// Contains information about a checkpoint including when it was created,
/// how many entries it contains, and whether it's been validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Monotonically increasing checkpoint identifier
    pub checkpoint_id: u64,
    /// Pipeline the checkpoint belongs to
    pub pipeline: String,
    /// When the checkpoint was created
    pub created_at: DateTime<Utc>,
    /// Number of window accumulators
    pub entry_count: usize,
    /// Accumulators changed since the previous checkpoint
    pub dirty_count: usize,
    /// Number of results awaiting delivery
    pub pending_count: usize,
    /// Size of the serialised state in bytes
    pub size_bytes: u64,
    /// SHA-256 of the serialised state
    pub checksum: String,
    /// Whether this checkpoint has been validated
    #[serde(skip)]
    pub validated: bool,
    /// Version of the checkpoint format
    pub version: u32,
}

/// A checkpoint: metadata plus the bincode-encoded [`CheckpointState`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    payload: Vec<u8>,
}

impl Checkpoint {
    /// Create a new checkpoint
    pub fn new(
        checkpoint_id: u64,
        pipeline: &str,
        state: &CheckpointState,
        dirty_count: usize,
    ) -> StateResult<Self> {
        let payload = bincode::serialize(state).map_err(|e| StateError::SerializationFailed {
            key: format!("{}/{}", pipeline, checkpoint_id),
            reason: e.to_string(),
        })?;

        Ok(Self {
            metadata: CheckpointMetadata {
                checkpoint_id,
                pipeline: pipeline.to_string(),
                created_at: Utc::now(),
                entry_count: state.accumulators.len(),
                dirty_count,
                pending_count: state.pending.len(),
                size_bytes: payload.len() as u64,
                checksum: Self::calculate_checksum(&payload),
                validated: true,
                version: CHECKPOINT_FORMAT_VERSION,
            },
            payload,
        })
    }

    /// Calculate SHA-256 checksum of the payload
    fn calculate_checksum(payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Validate the checkpoint's integrity
    pub fn validate(&mut self) -> StateResult<()> {
        if self.metadata.version != CHECKPOINT_FORMAT_VERSION {
            return Err(StateError::RestoreFailed {
                checkpoint_id: self.metadata.checkpoint_id.to_string(),
                reason: format!("unsupported format version {}", self.metadata.version),
            });
        }

        let calculated_checksum = Self::calculate_checksum(&self.payload);
        if calculated_checksum != self.metadata.checksum {
            return Err(StateError::CheckpointFailed {
                checkpoint_id: self.metadata.checkpoint_id.to_string(),
                reason: format!(
                    "Checksum mismatch: expected {}, got {}",
                    self.metadata.checksum, calculated_checksum
                ),
            });
        }

        self.metadata.validated = true;
        Ok(())
    }

    /// Decode the captured state
    pub fn state(&self) -> StateResult<CheckpointState> {
        bincode::deserialize(&self.payload).map_err(|e| StateError::DeserializationFailed {
            key: format!("{}/{}", self.metadata.pipeline, self.metadata.checkpoint_id),
            reason: e.to_string(),
        })
    }

    /// Save checkpoint to a file, atomically replacing any previous content
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> StateResult<()> {
        let path = path.as_ref();
        let checkpoint_id = self.metadata.checkpoint_id.to_string();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::CheckpointFailed {
                    checkpoint_id: checkpoint_id.clone(),
                    reason: format!("Failed to create directory: {}", e),
                })?;
        }

        let serialized = bincode::serialize(self).map_err(|e| StateError::SerializationFailed {
            key: checkpoint_id.clone(),
            reason: e.to_string(),
        })?;

        let tmp_path = path.with_extension("ckpt.tmp");
        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|e| StateError::CheckpointFailed {
                checkpoint_id: checkpoint_id.clone(),
                reason: format!("Failed to write file: {}", e),
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| StateError::CheckpointFailed {
                checkpoint_id,
                reason: format!("Failed to rename file: {}", e),
            })?;

        debug!(
            path = ?path,
            entries = self.metadata.entry_count,
            bytes = serialized.len(),
            "Checkpoint file written"
        );
        Ok(())
    }

    /// Load and validate a checkpoint from a file
    pub async fn load<P: AsRef<Path>>(path: P) -> StateResult<Self> {
        let path = path.as_ref();

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StateError::RestoreFailed {
                checkpoint_id: path.to_string_lossy().to_string(),
                reason: format!("Failed to read file: {}", e),
            })?;

        let mut checkpoint: Checkpoint =
            bincode::deserialize(&data).map_err(|e| StateError::DeserializationFailed {
                key: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;

        checkpoint.validate()?;
        Ok(checkpoint)
    }
}

/// Durable store of checkpoints for one pipeline
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Persist a checkpoint and apply the retention policy
    async fn save(&self, checkpoint: &Checkpoint) -> StateResult<()>;

    /// Newest checkpoint that validates, `None` if there is none at all.
    /// Fails when checkpoints exist but none of them is valid.
    async fn load_latest(&self) -> StateResult<Option<Checkpoint>>;

    /// Metadata of the stored valid checkpoints, newest first
    async fn list(&self) -> StateResult<Vec<CheckpointMetadata>>;

    /// Backend name for logs and errors
    fn backend_type(&self) -> &'static str;
}

/// Checkpoints as files `checkpoint_<id>.ckpt` in one directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStorage {
    dir: PathBuf,
    retention: usize,
}

impl FileCheckpointStorage {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_id: u64) -> PathBuf {
        self.dir
            .join(format!("checkpoint_{:020}.{}", checkpoint_id, CHECKPOINT_EXTENSION))
    }

    fn parse_id(path: &Path) -> Option<u64> {
        if path.extension().and_then(|s| s.to_str()) != Some(CHECKPOINT_EXTENSION) {
            return None;
        }
        path.file_stem()?
            .to_str()?
            .strip_prefix("checkpoint_")?
            .parse()
            .ok()
    }

    /// Checkpoint files, newest first
    async fn checkpoint_files(&self) -> StateResult<Vec<(u64, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::StorageError {
                    backend_type: self.backend_type().to_string(),
                    details: format!("Failed to read checkpoint directory: {}", e),
                })
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::StorageError {
                backend_type: self.backend_type().to_string(),
                details: format!("Failed to read directory entry: {}", e),
            })?
        {
            let path = entry.path();
            if let Some(id) = Self::parse_id(&path) {
                files.push((id, path));
            }
        }

        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }

    /// Clean up old checkpoints based on retention policy
    async fn cleanup_old_checkpoints(&self) -> StateResult<()> {
        for (_, path) in self.checkpoint_files().await?.into_iter().skip(self.retention) {
            debug!(path = ?path, "Deleting old checkpoint");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = ?path, error = %e, "Failed to delete checkpoint");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> StateResult<()> {
        checkpoint
            .save(self.path_for(checkpoint.metadata.checkpoint_id))
            .await?;
        self.cleanup_old_checkpoints().await
    }

    async fn load_latest(&self) -> StateResult<Option<Checkpoint>> {
        let files = self.checkpoint_files().await?;
        if files.is_empty() {
            return Ok(None);
        }

        for (id, path) in &files {
            match Checkpoint::load(path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => {
                    warn!(checkpoint_id = id, error = %e, "Skipping unreadable checkpoint");
                }
            }
        }

        Err(StateError::RestoreFailed {
            checkpoint_id: files[0].0.to_string(),
            reason: format!(
                "none of the {} checkpoints in {} is valid",
                files.len(),
                self.dir.display()
            ),
        })
    }

    async fn list(&self) -> StateResult<Vec<CheckpointMetadata>> {
        let mut result = Vec::new();
        for (_, path) in self.checkpoint_files().await? {
            if let Ok(checkpoint) = Checkpoint::load(&path).await {
                result.push(checkpoint.metadata);
            }
        }
        Ok(result)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

/// In-memory checkpoints; lost with the process
#[derive(Debug, Default)]
pub struct MemoryCheckpointStorage {
    checkpoints: Mutex<Vec<Checkpoint>>,
    retention: usize,
}

impl MemoryCheckpointStorage {
    pub fn new(retention: usize) -> Self {
        Self {
            checkpoints: Mutex::new(Vec::new()),
            retention: retention.max(1),
        }
    }

    /// Number of retained checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStorage for MemoryCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> StateResult<()> {
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.push(checkpoint.clone());
        let excess = checkpoints.len().saturating_sub(self.retention);
        checkpoints.drain(..excess);
        Ok(())
    }

    async fn load_latest(&self) -> StateResult<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().last().cloned())
    }

    async fn list(&self) -> StateResult<Vec<CheckpointMetadata>> {
        Ok(self
            .checkpoints
            .lock()
            .iter()
            .rev()
            .map(|c| c.metadata.clone())
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Statistics about checkpointing
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointStats {
    /// Total number of checkpoints created
    pub checkpoints_created: u64,
    /// Total number of checkpoints that failed after all retries
    pub checkpoint_failures: u64,
    /// Requests dropped because a checkpoint was already queued
    pub checkpoints_skipped: u64,
    /// Id of the last successful checkpoint
    pub last_checkpoint_id: Option<u64>,
    /// Last checkpoint timestamp
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    /// Last checkpoint duration in milliseconds
    pub last_checkpoint_duration_ms: Option<u64>,
    /// Total bytes checkpointed
    pub total_bytes_checkpointed: u64,
}

/// Snapshot handed to the coordinator
pub struct CheckpointRequest {
    pub snapshot: StoreSnapshot,
    pub pending: Vec<AggregatedResult>,
    ack: Option<oneshot::Sender<StateResult<u64>>>,
}

impl CheckpointRequest {
    pub fn new(snapshot: StoreSnapshot, pending: Vec<AggregatedResult>) -> Self {
        Self {
            snapshot,
            pending,
            ack: None,
        }
    }
}

struct CoordinatorTask {
    pipeline: String,
    storage: Arc<dyn CheckpointStorage>,
    retry: RetryConfig,
    committer: Option<Arc<dyn RecordSource>>,
    stats: Arc<Mutex<CheckpointStats>>,
    next_id: u64,
}

impl CoordinatorTask {
    async fn run(mut self, mut rx: mpsc::Receiver<CheckpointRequest>) {
        while let Some(mut request) = rx.recv().await {
            let ack = request.ack.take();
            let result = self.write(request).await;

            match &result {
                Ok(id) => debug!(pipeline = %self.pipeline, checkpoint_id = id, "Checkpoint complete"),
                Err(e) => {
                    self.stats.lock().checkpoint_failures += 1;
                    error!(
                        pipeline = %self.pipeline,
                        error = %e,
                        "Checkpoint failed, previous checkpoint remains the recovery point"
                    );
                }
            }

            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
        }
        debug!(pipeline = %self.pipeline, "Checkpoint coordinator stopped");
    }

    async fn write(&mut self, request: CheckpointRequest) -> StateResult<u64> {
        let started = Instant::now();
        let checkpoint_id = self.next_id;
        let pipeline = self.pipeline.clone();
        let offsets = request.snapshot.offsets.clone();

        let checkpoint = tokio::task::spawn_blocking(move || {
            let dirty = request.snapshot.dirty_count();
            let state = request.snapshot.into_state(request.pending);
            Checkpoint::new(checkpoint_id, &pipeline, &state, dirty)
        })
        .await
        .map_err(|e| StateError::CheckpointFailed {
            checkpoint_id: checkpoint_id.to_string(),
            reason: format!("serialization task failed: {}", e),
        })??;

        let storage = Arc::clone(&self.storage);
        retry_with_backoff(
            &self.retry,
            "checkpoint_save",
            |e: &StateError| !matches!(e, StateError::SerializationFailed { .. }),
            |_| storage.save(&checkpoint),
        )
        .await?;

        self.next_id += 1;
        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut stats = self.stats.lock();
            stats.checkpoints_created += 1;
            stats.last_checkpoint_id = Some(checkpoint_id);
            stats.last_checkpoint_time = Some(checkpoint.metadata.created_at);
            stats.last_checkpoint_duration_ms = Some(duration_ms);
            stats.total_bytes_checkpointed += checkpoint.metadata.size_bytes;
        }

        info!(
            pipeline = %self.pipeline,
            checkpoint_id,
            entries = checkpoint.metadata.entry_count,
            dirty = checkpoint.metadata.dirty_count,
            pending = checkpoint.metadata.pending_count,
            bytes = checkpoint.metadata.size_bytes,
            duration_ms,
            "Checkpoint created"
        );

        if let Some(committer) = &self.committer {
            if let Err(e) = committer.commit(&offsets).await {
                warn!(pipeline = %self.pipeline, error = %e, "Offset commit after checkpoint failed");
            }
        }

        Ok(checkpoint_id)
    }
}

/// Checkpoint coordinator
///
/// Owns a background task that serialises snapshots and writes them with
/// retry and backoff. Periodic requests are best effort: while one
/// checkpoint is queued further requests are skipped. Forced requests wait
/// for their result.
pub struct CheckpointCoordinator {
    pipeline: String,
    tx: Option<mpsc::Sender<CheckpointRequest>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<CheckpointStats>>,
}

impl CheckpointCoordinator {
    /// Spawn the coordinator task
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Name used in checkpoint metadata and logs
    /// * `storage` - Where checkpoints are written
    /// * `retry` - Retry policy for writes
    /// * `committer` - Source whose offsets are committed after each checkpoint
    /// * `next_id` - Id of the first checkpoint written
    pub fn start(
        pipeline: impl Into<String>,
        storage: Arc<dyn CheckpointStorage>,
        retry: RetryConfig,
        committer: Option<Arc<dyn RecordSource>>,
        next_id: u64,
    ) -> Self {
        let pipeline = pipeline.into();
        let stats = Arc::new(Mutex::new(CheckpointStats::default()));
        let (tx, rx) = mpsc::channel(1);

        let task = CoordinatorTask {
            pipeline: pipeline.clone(),
            storage,
            retry,
            committer,
            stats: Arc::clone(&stats),
            next_id,
        };
        let handle = tokio::spawn(task.run(rx));

        Self {
            pipeline,
            tx: Some(tx),
            handle: Some(handle),
            stats,
        }
    }

    /// Queue a checkpoint without waiting; returns false when skipped
    pub fn try_submit(&self, request: CheckpointRequest) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.lock().checkpoints_skipped += 1;
                debug!(pipeline = %self.pipeline, "Checkpoint already in progress, skipping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Write a checkpoint and wait for the outcome
    pub async fn checkpoint_now(&self, mut request: CheckpointRequest) -> StateResult<u64> {
        let tx = self.tx.as_ref().ok_or_else(|| StateError::CheckpointFailed {
            checkpoint_id: "final".to_string(),
            reason: "checkpoint coordinator is shut down".to_string(),
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        request.ack = Some(ack_tx);

        let closed = || StateError::CheckpointFailed {
            checkpoint_id: "final".to_string(),
            reason: "checkpoint coordinator stopped".to_string(),
        };
        tx.send(request).await.map_err(|_| closed())?;
        ack_rx.await.map_err(|_| closed())?
    }

    /// Get checkpoint statistics
    pub fn stats(&self) -> CheckpointStats {
        self.stats.lock().clone()
    }

    /// Stop the task after all queued checkpoints are written
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(pipeline = %self.pipeline, "Checkpoint task panicked: {}", e);
            }
        }
    }
}
