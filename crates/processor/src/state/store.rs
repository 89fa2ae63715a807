//! Sharded window state store
//!
//! Holds one accumulator per (grouping key, window). Keys are partitioned
//! over shards by hash; every shard is an `Arc` that is copied on write, so a
//! snapshot only clones the shard pointers. Serialisation of a snapshot then
//! happens off the accumulation path while new updates go to fresh copies of
//! the touched shards.

use crate::core::GroupingKey;
use crate::kafka::SourceOffsets;
use crate::watermark::Watermark;
use crate::window::{WindowBounds, WindowKey};
use adstream_types::{AggregatedResult, EventKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::checkpoint::CheckpointState;

/// Running count of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    pub count: u64,
    /// Store version of the last update; newer than the last snapshot means dirty
    pub updated_version: u64,
}

/// A window removed from the store by [`WindowStateStore::tick`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredWindow {
    pub window: WindowKey,
    pub count: u64,
}

impl FiredWindow {
    pub fn into_result(self, event_type: EventKind) -> AggregatedResult {
        AggregatedResult::new(
            self.window.key.into_string(),
            self.window.bounds.start,
            self.window.bounds.end,
            self.count,
            event_type,
        )
    }
}

#[derive(Debug, Clone, Default)]
struct Shard {
    accumulators: HashMap<WindowKey, WindowAccumulator>,
}

/// Point-in-time view of the store, cheap to take
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    shards: Vec<Arc<Shard>>,
    pub offsets: SourceOffsets,
    pub watermark: Watermark,
    /// Version of the last update included in the snapshot
    pub version: u64,
    /// Version of the previous snapshot; entries updated after it are dirty
    pub base_version: u64,
}

impl StoreSnapshot {
    /// Number of accumulators in the snapshot
    pub fn entry_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.accumulators.len()).sum()
    }

    /// Accumulators changed since the previous snapshot
    pub fn dirty_count(&self) -> usize {
        self.shards
            .iter()
            .flat_map(|shard| shard.accumulators.values())
            .filter(|acc| acc.updated_version > self.base_version)
            .count()
    }

    /// Flatten into the serialisable checkpoint state
    pub fn into_state(self, pending: Vec<AggregatedResult>) -> CheckpointState {
        let mut accumulators: Vec<(WindowKey, WindowAccumulator)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .accumulators
                    .iter()
                    .map(|(key, acc)| (key.clone(), *acc))
            })
            .collect();
        accumulators.sort_by(|a, b| a.0.cmp(&b.0));

        CheckpointState {
            accumulators,
            offsets: self.offsets,
            watermark: self.watermark,
            pending,
            version: self.version,
        }
    }
}

/// Keyed, sharded store of in-flight window counts
pub struct WindowStateStore {
    shards: Vec<Mutex<Arc<Shard>>>,
    offsets: Mutex<SourceOffsets>,
    allowed_lateness: chrono::Duration,
    fired_watermark: Mutex<Watermark>,
    version: AtomicU64,
    snapshot_version: AtomicU64,
}

impl WindowStateStore {
    /// Create a store with `shards` key partitions
    pub fn new(shards: usize, allowed_lateness: chrono::Duration) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(Arc::new(Shard::default())))
                .collect(),
            offsets: Mutex::new(SourceOffsets::new()),
            allowed_lateness,
            fired_watermark: Mutex::new(Watermark::min()),
            version: AtomicU64::new(0),
            snapshot_version: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &GroupingKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Add `delta` to the window's count, creating the accumulator if absent.
    /// Returns the new count.
    pub fn accumulate(&self, window: WindowKey, delta: u64) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let index = self.shard_index(&window.key);

        let mut guard = self.shards[index].lock();
        let shard = Arc::make_mut(&mut *guard);
        let acc = shard
            .accumulators
            .entry(window)
            .or_insert(WindowAccumulator {
                count: 0,
                updated_version: version,
            });
        acc.count = acc.count.saturating_add(delta);
        acc.updated_version = version;
        acc.count
    }

    /// Whether `bounds` already fired; events for it must be dropped
    pub fn is_late(&self, bounds: &WindowBounds) -> bool {
        let fired = *self.fired_watermark.lock();
        !fired.is_min() && bounds.is_closed(fired.timestamp, self.allowed_lateness)
    }

    /// Remove and return every window with `end + lateness <= watermark`,
    /// ordered by window start then key
    pub fn tick(&self, watermark: Watermark) -> Vec<FiredWindow> {
        {
            let mut fired = self.fired_watermark.lock();
            if watermark > *fired {
                *fired = watermark;
            }
        }
        if watermark.is_min() {
            return Vec::new();
        }

        let mut fired = Vec::new();
        for slot in &self.shards {
            let mut guard = slot.lock();
            let due: Vec<WindowKey> = guard
                .accumulators
                .keys()
                .filter(|key| key.bounds.is_closed(watermark.timestamp, self.allowed_lateness))
                .cloned()
                .collect();
            if due.is_empty() {
                continue;
            }

            let shard = Arc::make_mut(&mut *guard);
            for key in due {
                if let Some(acc) = shard.accumulators.remove(&key) {
                    fired.push(FiredWindow {
                        window: key,
                        count: acc.count,
                    });
                }
            }
        }

        fired.sort_by(|a, b| a.window.cmp(&b.window));
        if !fired.is_empty() {
            debug!(watermark = %watermark, windows = fired.len(), "Fired windows");
        }
        fired
    }

    /// Mark a source record as processed
    pub fn record_offset(&self, topic: &str, partition: i32, offset: i64) {
        self.offsets.lock().record(topic, partition, offset);
    }

    pub fn offsets(&self) -> SourceOffsets {
        self.offsets.lock().clone()
    }

    /// Highest watermark passed to [`tick`](Self::tick)
    pub fn fired_watermark(&self) -> Watermark {
        *self.fired_watermark.lock()
    }

    /// Copy-on-write snapshot of accumulators, offsets and watermark
    ///
    /// Offsets are read before the shards, so a concurrent writer can only
    /// leave counts in the snapshot whose offsets are missing (replayed as
    /// duplicates), never offsets whose counts are missing.
    pub fn snapshot(&self) -> StoreSnapshot {
        let offsets = self.offsets();
        let watermark = self.fired_watermark();
        let version = self.version.load(Ordering::SeqCst);
        let base_version = self.snapshot_version.load(Ordering::SeqCst);

        let shards = self
            .shards
            .iter()
            .map(|slot| Arc::clone(&slot.lock()))
            .collect();

        StoreSnapshot {
            shards,
            offsets,
            watermark,
            version,
            base_version,
        }
    }

    /// Updates up to `version` are covered by an accepted checkpoint
    pub fn mark_snapshot_taken(&self, version: u64) {
        self.snapshot_version.fetch_max(version, Ordering::SeqCst);
    }

    /// Serialisable state of the whole store
    pub fn checkpoint(&self, pending: Vec<AggregatedResult>) -> CheckpointState {
        let snapshot = self.snapshot();
        self.mark_snapshot_taken(snapshot.version);
        snapshot.into_state(pending)
    }

    /// Replace all in-memory state with `state`
    pub fn restore(&self, state: &CheckpointState) {
        let mut shards: Vec<Shard> = (0..self.shards.len()).map(|_| Shard::default()).collect();
        for (key, acc) in &state.accumulators {
            let index = self.shard_index(&key.key);
            shards[index].accumulators.insert(key.clone(), *acc);
        }

        for (slot, shard) in self.shards.iter().zip(shards) {
            *slot.lock() = Arc::new(shard);
        }

        *self.offsets.lock() = state.offsets.clone();
        *self.fired_watermark.lock() = state.watermark;

        let version = state
            .accumulators
            .iter()
            .map(|(_, acc)| acc.updated_version)
            .max()
            .unwrap_or(0)
            .max(state.version);
        self.version.store(version, Ordering::SeqCst);
        self.snapshot_version.store(version, Ordering::SeqCst);
    }

    /// Current count of a window, if it is open
    pub fn count(&self, window: &WindowKey) -> Option<u64> {
        let index = self.shard_index(&window.key);
        let guard = self.shards[index].lock();
        guard.accumulators.get(window).map(|acc| acc.count)
    }

    /// Number of open windows
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|slot| slot.lock().accumulators.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accumulators changed since the last snapshot
    pub fn dirty_count(&self) -> usize {
        let base = self.snapshot_version.load(Ordering::SeqCst);
        self.shards
            .iter()
            .map(|slot| {
                slot.lock()
                    .accumulators
                    .values()
                    .filter(|acc| acc.updated_version > base)
                    .count()
            })
            .sum()
    }
}
