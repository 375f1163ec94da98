//! All slot state of one shard

use std::collections::BTreeMap;

use super::slot_manager::SlotStateManager;
use super::stamp::UpdateStamp;
use crate::rollup::Granularity;
use crate::types::ShardId;

/// Stamps of one shard, keyed by granularity then slot
///
/// This is the unit exchanged with the shard state store.
pub type ShardStateMap = BTreeMap<Granularity, BTreeMap<usize, UpdateStamp>>;

/// Slot state managers for every rollup granularity of one shard
///
/// The set of managers is fixed at construction; only their contents
/// change.
#[derive(Debug)]
pub struct ShardStateManager {
    shard: ShardId,
    managers: BTreeMap<Granularity, SlotStateManager>,
}

impl ShardStateManager {
    /// Create empty state for `shard`
    pub fn new(shard: ShardId) -> Self {
        let managers = Granularity::rollup_granularities()
            .iter()
            .map(|g| (*g, SlotStateManager::new(shard, *g)))
            .collect();
        Self { shard, managers }
    }

    /// Shard identifier
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Manager for `granularity`; `None` for raw data
    pub fn slot_manager(&self, granularity: Granularity) -> Option<&SlotStateManager> {
        self.managers.get(&granularity)
    }

    /// Managers, finest first
    pub fn slot_managers(&self) -> impl Iterator<Item = &SlotStateManager> {
        self.managers.values()
    }

    /// Mark the slot containing `sample_millis` Active at every granularity
    pub fn mark_sample(&self, sample_millis: i64, observed_at: i64) {
        for (granularity, manager) in &self.managers {
            manager.mark_active(granularity.slot(sample_millis), observed_at);
        }
    }

    /// Apply persisted stamps; returns how many replaced local state
    pub fn load(&self, persisted: &ShardStateMap) -> usize {
        persisted
            .iter()
            .filter_map(|(g, slots)| self.managers.get(g).map(|m| (m, slots)))
            .map(|(manager, slots)| {
                slots
                    .iter()
                    .filter(|(slot, stamp)| manager.load(**slot, **stamp))
                    .count()
            })
            .sum()
    }

    /// Snapshot of the stamps changed since the last push
    pub fn dirty_snapshot(&self) -> ShardStateMap {
        self.managers
            .iter()
            .map(|(g, m)| (*g, m.dirty_stamps()))
            .filter(|(_, slots)| !slots.is_empty())
            .collect()
    }

    /// Clear dirty flags of stamps unchanged since `pushed` was taken
    pub fn clear_dirty(&self, pushed: &ShardStateMap) -> usize {
        pushed
            .iter()
            .filter_map(|(g, slots)| self.managers.get(g).map(|m| m.clear_dirty(slots)))
            .sum()
    }

    /// Snapshot of every stamp
    pub fn snapshot(&self) -> ShardStateMap {
        self.managers
            .iter()
            .map(|(g, m)| (*g, m.stamps()))
            .filter(|(_, slots)| !slots.is_empty())
            .collect()
    }
}
