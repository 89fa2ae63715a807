//! State management for window aggregation
//!
//! This module holds the in-flight window counts of a pipeline and makes them
//! durable. It supports:
//!
//! - **Sharded Store**: Per-key accumulators partitioned over copy-on-write shards
//! - **Dirty Tracking**: Version counters identify accumulators changed since the last snapshot
//! - **Checkpointing**: Periodic snapshots written by a background coordinator
//! - **Recovery**: Restore from the newest valid checkpoint, skipping corrupt ones
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use processor::state::{Checkpoint, CheckpointStorage, FileCheckpointStorage, WindowStateStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = WindowStateStore::new(8, chrono::Duration::zero());
//!     store.record_offset("bid-requests", 0, 41);
//!
//!     let storage = FileCheckpointStorage::new("/tmp/adstream/bid_requests", 3);
//!     let checkpoint = Checkpoint::new(1, "bid_requests", &store.checkpoint(Vec::new()), 0)?;
//!     storage.save(&checkpoint).await?;
//!
//!     if let Some(latest) = storage.load_latest().await? {
//!         let restored = WindowStateStore::new(8, chrono::Duration::zero());
//!         restored.restore(&latest.state()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod store;

pub use checkpoint::{
    Checkpoint, CheckpointCoordinator, CheckpointMetadata, CheckpointRequest, CheckpointState,
    CheckpointStats, CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage,
};
pub use store::{FiredWindow, StoreSnapshot, WindowAccumulator, WindowStateStore};

/// Type alias for state operation results
pub type StateResult<T> = Result<T, crate::error::StateError>;
