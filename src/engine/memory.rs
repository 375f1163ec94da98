//! In-memory reference store
//!
//! Implements both [`MetricStore`] and [`ShardStateStore`] on plain maps.
//! Used by the simulator, the integration tests and benchmarks.
//!
//! # Warning
//!
//! Loses everything on drop. Faults and latency can be injected per
//! operation to exercise the retry paths of the rollup service.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::traits::{MetricStore, RollupWrite, ShardStateStore};
use crate::error::StorageError;
use crate::rollup::{Granularity, Range, RollupType, StoredRollup};
use crate::state::{merge_persisted, ShardStateMap};
use crate::types::{Locator, Points, Sample, ShardId, SimpleNumber, DEFAULT_SHARD_COUNT};

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `read_raw`
    ReadRaw,
    /// `read_rollups`
    ReadRollups,
    /// `write_rollups`
    WriteRollups,
    /// `persist_shard_state`
    PersistState,
    /// `load_shard_state`
    LoadState,
}

impl FailPoint {
    fn operation(self) -> &'static str {
        match self {
            FailPoint::ReadRaw => "read_raw",
            FailPoint::ReadRollups => "read_rollups",
            FailPoint::WriteRollups => "write_rollups",
            FailPoint::PersistState => "persist_shard_state",
            FailPoint::LoadState => "load_shard_state",
        }
    }
}

type RollupKey = (Locator, Granularity, RollupType);

/// Operation counters
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Raw samples written
    pub raw_writes: AtomicU64,
    /// Rollups written (each element of a batch counts)
    pub rollup_writes: AtomicU64,
    /// Successful state pushes
    pub state_pushes: AtomicU64,
}

/// Map-backed store
#[derive(Debug)]
pub struct InMemoryStore {
    shard_count: u32,
    raw: RwLock<HashMap<Locator, BTreeMap<i64, SimpleNumber>>>,
    rollups: RwLock<HashMap<RollupKey, BTreeMap<i64, StoredRollup>>>,
    shard_state: RwLock<HashMap<ShardId, ShardStateMap>>,
    faults: Mutex<HashMap<FailPoint, usize>>,
    read_delay: Mutex<Option<Duration>>,
    stats: StoreStats,
}

impl InMemoryStore {
    /// Create an empty store spreading locators over `shard_count` shards
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count,
            raw: RwLock::new(HashMap::new()),
            rollups: RwLock::new(HashMap::new()),
            shard_state: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            read_delay: Mutex::new(None),
            stats: StoreStats::default(),
        }
    }

    /// Number of shards locators are spread over
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Make the next `times` calls of `point` fail with a transient error
    pub fn fail_next(&self, point: FailPoint, times: usize) {
        *self.faults.lock().entry(point).or_insert(0) += times;
    }

    /// Delay every read by `delay`, or remove the delay with `None`
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Operation counters
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Every stored rollup of one kind for a locator
    pub fn stored_rollups(
        &self,
        locator: &Locator,
        granularity: Granularity,
        rollup_type: RollupType,
    ) -> Points<StoredRollup> {
        self.rollups
            .read()
            .get(&(locator.clone(), granularity, rollup_type))
            .map(|points| points.iter().map(|(ts, r)| (*ts, r.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of stored rollups at `granularity`, across locators and kinds
    pub fn rollup_count(&self, granularity: Granularity) -> usize {
        self.rollups
            .read()
            .iter()
            .filter(|((_, g, _), _)| *g == granularity)
            .map(|(_, points)| points.len())
            .sum()
    }

    /// Persisted state of `shard`, as last pushed
    pub fn persisted_state(&self, shard: ShardId) -> ShardStateMap {
        self.shard_state.read().get(&shard).cloned().unwrap_or_default()
    }

    fn check_fault(&self, point: FailPoint) -> Result<(), StorageError> {
        let mut faults = self.faults.lock();
        match faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StorageError::transient(point.operation(), "injected failure"))
            },
            _ => Ok(()),
        }
    }

    async fn read_latency(&self) {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

fn in_range<T: Clone>(points: &BTreeMap<i64, T>, range: Range) -> Points<T> {
    if range.stop <= range.start {
        return Points::new();
    }
    points
        .range(range.start..range.stop)
        .map(|(ts, v)| (*ts, v.clone()))
        .collect()
}

#[async_trait]
impl MetricStore for InMemoryStore {
    async fn read_raw(&self, locator: &Locator, range: Range) -> Result<Points<SimpleNumber>, StorageError> {
        self.read_latency().await;
        self.check_fault(FailPoint::ReadRaw)?;
        Ok(self
            .raw
            .read()
            .get(locator)
            .map(|points| in_range(points, range))
            .unwrap_or_default())
    }

    async fn read_rollups(
        &self,
        locator: &Locator,
        range: Range,
        granularity: Granularity,
        rollup_type: RollupType,
    ) -> Result<Points<StoredRollup>, StorageError> {
        self.read_latency().await;
        self.check_fault(FailPoint::ReadRollups)?;
        Ok(self
            .rollups
            .read()
            .get(&(locator.clone(), granularity, rollup_type))
            .map(|points| in_range(points, range))
            .unwrap_or_default())
    }

    async fn write_rollups(&self, writes: Vec<RollupWrite>) -> Result<(), StorageError> {
        self.check_fault(FailPoint::WriteRollups)?;
        let count = writes.len() as u64;
        let mut rollups = self.rollups.write();
        for write in writes {
            let key = (write.locator, write.granularity, write.rollup.rollup_type());
            rollups.entry(key).or_default().insert(write.timestamp, write.rollup);
        }
        self.stats.rollup_writes.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    async fn write_raw_sample(&self, sample: &Sample) -> Result<(), StorageError> {
        self.raw
            .write()
            .entry(sample.locator.clone())
            .or_default()
            .insert(sample.timestamp_ms, sample.value);
        self.stats.raw_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn locators_for_shard(&self, shard: ShardId) -> Result<BTreeSet<Locator>, StorageError> {
        Ok(self
            .raw
            .read()
            .keys()
            .filter(|locator| locator.shard(self.shard_count) == shard)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ShardStateStore for InMemoryStore {
    async fn persist_shard_state(&self, shard: ShardId, state: &ShardStateMap) -> Result<(), StorageError> {
        self.check_fault(FailPoint::PersistState)?;
        let mut stored = self.shard_state.write();
        let persisted = stored.entry(shard).or_default();
        for (granularity, slots) in state {
            let persisted_slots = persisted.entry(*granularity).or_default();
            for (slot, stamp) in slots {
                if let Some(kept) = merge_persisted(persisted_slots.get(slot), stamp.clean()) {
                    persisted_slots.insert(*slot, kept);
                }
            }
        }
        self.stats.state_pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_shard_state(&self, shard: ShardId) -> Result<ShardStateMap, StorageError> {
        self.check_fault(FailPoint::LoadState)?;
        Ok(self.persisted_state(shard))
    }
}
