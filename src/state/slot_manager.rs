//! Slot state for one (shard, granularity)

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use super::stamp::{coalesce, SlotState, UpdateStamp};
use crate::rollup::Granularity;
use crate::types::ShardId;

/// Slot index to stamp mapping for one shard at one granularity
///
/// All mutation goes through coalescing under the internal lock, so
/// concurrent ingestion, completion and state loads never observe a torn
/// stamp.
#[derive(Debug)]
pub struct SlotStateManager {
    shard: ShardId,
    granularity: Granularity,
    slots: Mutex<HashMap<usize, UpdateStamp>>,
}

impl SlotStateManager {
    /// Create an empty manager
    pub fn new(shard: ShardId, granularity: Granularity) -> Self {
        Self {
            shard,
            granularity,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Shard this manager belongs to
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Granularity this manager tracks
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Coalesce `incoming` into the stamp of `slot`; returns whether it was kept
    pub fn coalesce(&self, slot: usize, incoming: UpdateStamp) -> bool {
        let mut slots = self.slots.lock();
        match coalesce(slots.get(&slot), incoming) {
            Some(kept) => {
                slots.insert(slot, kept);
                true
            },
            None => false,
        }
    }

    /// Record a write observed at `timestamp`
    pub fn mark_active(&self, slot: usize, timestamp: i64) -> bool {
        self.coalesce(slot, UpdateStamp::active(timestamp))
    }

    /// Apply a stamp read back from the shard state store
    ///
    /// Uses the normal coalescing rule but stores the winner clean, since it
    /// is already persisted. A local completion not yet pushed is kept over
    /// the persisted Active stamp it rolled.
    pub fn load(&self, slot: usize, stamp: UpdateStamp) -> bool {
        let mut slots = self.slots.lock();
        let current = slots.get(&slot);
        if let Some(current) = current {
            if current.is_dirty()
                && current.state() == SlotState::Rolled
                && stamp.is_active()
                && stamp.timestamp() == current.timestamp()
            {
                return false;
            }
        }
        match coalesce(current, stamp.clean()) {
            Some(kept) => {
                slots.insert(slot, kept);
                true
            },
            None => false,
        }
    }

    /// Mark `slot` Rolled if it is still Active at `captured_timestamp`
    ///
    /// A newer write keeps the slot Active so it gets rolled again. Returns
    /// whether the slot changed.
    pub fn mark_rolled(&self, slot: usize, captured_timestamp: i64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&slot) {
            Some(stamp) if stamp.is_active() && stamp.timestamp() == captured_timestamp => {
                *stamp = UpdateStamp::rolled(captured_timestamp);
                true
            },
            Some(stamp) => {
                trace!(
                    shard = self.shard,
                    granularity = %self.granularity,
                    slot,
                    state = %stamp.state(),
                    stamp_ts = stamp.timestamp(),
                    captured_ts = captured_timestamp,
                    "Slot changed while rolling, leaving it as is"
                );
                false
            },
            None => false,
        }
    }

    /// Make `slot` Active again without moving its timestamp forward
    ///
    /// Relies on Active winning the tie over Rolled. A slot with no stamp is
    /// marked Active at `fallback_timestamp`.
    pub fn reactivate(&self, slot: usize, fallback_timestamp: i64) -> bool {
        let timestamp = self
            .get(slot)
            .map_or(fallback_timestamp, |stamp| stamp.timestamp());
        self.mark_active(slot, timestamp)
    }

    /// Stamp of `slot`, if any
    pub fn get(&self, slot: usize) -> Option<UpdateStamp> {
        self.slots.lock().get(&slot).copied()
    }

    /// Whether `slot` has unrolled data
    pub fn is_active(&self, slot: usize) -> bool {
        self.slots
            .lock()
            .get(&slot)
            .is_some_and(UpdateStamp::is_active)
    }

    /// Active slots whose last write is more than `delay_ms` before `now`
    pub fn quiesced_active(&self, now: i64, delay_ms: i64) -> Vec<(usize, UpdateStamp)> {
        self.active_older_than(now, delay_ms)
    }

    /// Active slots whose last write is more than `threshold_ms` before `now`
    pub fn active_older_than(&self, now: i64, threshold_ms: i64) -> Vec<(usize, UpdateStamp)> {
        let slots = self.slots.lock();
        let mut found: Vec<(usize, UpdateStamp)> = slots
            .iter()
            .filter(|(_, stamp)| stamp.is_active() && now - stamp.timestamp() > threshold_ms)
            .map(|(slot, stamp)| (*slot, *stamp))
            .collect();
        found.sort_unstable_by_key(|(slot, _)| *slot);
        found
    }

    /// Number of Active slots
    pub fn active_count(&self) -> usize {
        self.slots.lock().values().filter(|s| s.is_active()).count()
    }

    /// Copy of every stamp, ordered by slot
    pub fn stamps(&self) -> BTreeMap<usize, UpdateStamp> {
        self.slots.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Copy of the stamps changed since the last push
    pub fn dirty_stamps(&self) -> BTreeMap<usize, UpdateStamp> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, stamp)| stamp.is_dirty())
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// Clear the dirty flag of stamps that still match a pushed snapshot
    ///
    /// Stamps that changed after the snapshot was taken stay dirty and go
    /// out with the next push.
    pub fn clear_dirty(&self, pushed: &BTreeMap<usize, UpdateStamp>) -> usize {
        let mut slots = self.slots.lock();
        let mut cleared = 0;
        for (slot, snapshot) in pushed {
            if let Some(stamp) = slots.get_mut(slot) {
                if stamp.is_dirty() && stamp.same_as(snapshot) {
                    *stamp = stamp.clean();
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Number of tracked slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot has a stamp
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// State of `slot`, if tracked
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.get(slot).map(|s| s.state())
    }
}
