use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rollup::{Granularity, Range};
use crate::state::{ShardStateManager, UpdateStamp};
use crate::types::ShardId;

// ============================================================================
// Keys and units
// ============================================================================

/// Address of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Shard owning the slot
    pub shard: ShardId,
    /// Rollup granularity
    pub granularity: Granularity,
    /// Slot index within the rotation
    pub slot: usize,
}

impl SlotKey {
    /// Create a key
    pub fn new(shard: ShardId, granularity: Granularity, slot: usize) -> Self {
        Self {
            shard,
            granularity,
            slot,
        }
    }

    /// Keys of the finer slots this slot is rolled up from
    ///
    /// Empty for 5-minute slots, which read raw data.
    pub fn children(&self) -> Vec<SlotKey> {
        match self.granularity.finer() {
            Some(finer) if finer.is_rollup() => self
                .granularity
                .finer_slots(self.slot)
                .map(|slot| SlotKey::new(self.shard, finer, slot))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.granularity.name(), self.slot, self.shard)
    }
}

/// One slot handed out for rollup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledUnit {
    /// Slot to roll up
    pub key: SlotKey,
    /// Time range of the slot
    pub range: Range,
    /// Timestamp of the Active stamp when the unit was scheduled
    pub stamp_timestamp: i64,
}

#[derive(Debug, Default)]
struct WorkQueue {
    scheduled: VecDeque<ScheduledUnit>,
    scheduled_keys: HashSet<SlotKey>,
    running: HashMap<SlotKey, ScheduledUnit>,
}

impl WorkQueue {
    fn is_queued(&self, key: &SlotKey) -> bool {
        self.scheduled_keys.contains(key) || self.running.contains_key(key)
    }

    fn push_back(&mut self, unit: ScheduledUnit) {
        if self.scheduled_keys.insert(unit.key) {
            self.scheduled.push_back(unit);
        }
    }

    fn push_front(&mut self, unit: ScheduledUnit) {
        if self.scheduled_keys.insert(unit.key) {
            self.scheduled.push_front(unit);
        }
    }
}

// ============================================================================
// Schedule context
// ============================================================================

/// Scheduling state for every shard managed by this process
///
/// Lock order is queue, then slot managers. Stamps are never mutated while
/// the queue lock is held.
#[derive(Debug)]
pub struct ScheduleContext {
    current_time: AtomicI64,
    quiescence_delay_ms: i64,
    shards: RwLock<BTreeMap<ShardId, Arc<ShardStateManager>>>,
    queue: Mutex<WorkQueue>,
}

impl ScheduleContext {
    /// Create a context managing `shards`
    ///
    /// `quiescence_delay` is how long a slot must go without writes before it
    /// is eligible for rollup.
    pub fn new(
        current_millis: i64,
        shards: impl IntoIterator<Item = ShardId>,
        quiescence_delay: Duration,
    ) -> Self {
        let shards = shards
            .into_iter()
            .map(|shard| (shard, Arc::new(ShardStateManager::new(shard))))
            .collect();
        Self {
            current_time: AtomicI64::new(current_millis),
            quiescence_delay_ms: quiescence_delay.as_millis() as i64,
            shards: RwLock::new(shards),
            queue: Mutex::new(WorkQueue::default()),
        }
    }

    /// Advance (or set) the clock used for quiescence decisions
    pub fn set_current_time_millis(&self, millis: i64) {
        self.current_time.store(millis, Ordering::SeqCst);
    }

    /// Current scheduling clock
    pub fn current_time_millis(&self) -> i64 {
        self.current_time.load(Ordering::SeqCst)
    }

    /// Quiescence delay in milliseconds
    pub fn quiescence_delay_ms(&self) -> i64 {
        self.quiescence_delay_ms
    }

    /// Record a sample at `sample_millis` for `shard`
    ///
    /// The slot containing the sample becomes Active at every rollup
    /// granularity, stamped with the current clock. Samples for shards this
    /// process does not manage are ignored.
    pub fn update(&self, sample_millis: i64, shard: ShardId) {
        match self.shard_state_manager(shard) {
            Some(manager) => manager.mark_sample(sample_millis, self.current_time_millis()),
            None => debug!(shard, "Ignoring update for unmanaged shard"),
        }
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Queue every slot that is ready to be rolled up; returns how many
    ///
    /// A slot is ready when it is Active, has had no writes for the
    /// quiescence delay, is not already queued or running, and (above 5m)
    /// none of its finer slots is Active, queued or running.
    pub fn schedule_eligible_slots(&self) -> usize {
        let now = self.current_time_millis();
        let shards = self.shard_snapshot();
        let mut queue = self.queue.lock();
        let mut added = 0;

        for manager in &shards {
            for slots in manager.slot_managers() {
                let granularity = slots.granularity();
                for (slot, stamp) in slots.quiesced_active(now, self.quiescence_delay_ms) {
                    let key = SlotKey::new(manager.shard(), granularity, slot);
                    if queue.is_queued(&key) {
                        continue;
                    }
                    if let Some(blocking) = Self::blocking_child(manager, &key, Some(&*queue)) {
                        debug!(slot_key = %key, child = %blocking, "Finer slot not rolled yet");
                        continue;
                    }
                    queue.push_back(ScheduledUnit {
                        key,
                        range: granularity.derive_range(slot, now),
                        stamp_timestamp: stamp.timestamp(),
                    });
                    added += 1;
                }
            }
        }

        if added > 0 {
            debug!(added, scheduled = queue.scheduled.len(), "Scheduled slots for rollup");
        }
        added
    }

    /// First finer slot that prevents `key` from being rolled up
    fn blocking_child(
        manager: &ShardStateManager,
        key: &SlotKey,
        queue: Option<&WorkQueue>,
    ) -> Option<SlotKey> {
        let finer = key.granularity.finer()?;
        let finer_slots = manager.slot_manager(finer)?;
        key.children().into_iter().find(|child| {
            finer_slots.is_active(child.slot) || queue.is_some_and(|q| q.is_queued(child))
        })
    }

    /// Take the next unit, moving it to the running set
    pub fn next_scheduled(&self) -> Option<ScheduledUnit> {
        let mut queue = self.queue.lock();
        let unit = queue.scheduled.pop_front()?;
        queue.scheduled_keys.remove(&unit.key);
        queue.running.insert(unit.key, unit.clone());
        Some(unit)
    }

    /// Whether any unit is waiting
    pub fn has_scheduled(&self) -> bool {
        !self.queue.lock().scheduled.is_empty()
    }

    /// Units waiting to run
    pub fn scheduled_count(&self) -> usize {
        self.queue.lock().scheduled.len()
    }

    /// Units handed out and not yet completed or failed
    pub fn running_count(&self) -> usize {
        self.queue.lock().running.len()
    }

    /// Check that `key` may still be rolled up
    ///
    /// A finer slot that went Active after scheduling makes the unit
    /// inconsistent. Such units are skipped and rescheduled later, never
    /// forced.
    pub fn verify_ready(&self, key: &SlotKey) -> Result<()> {
        let manager = self.shard_state_manager(key.shard).ok_or_else(|| Error::InconsistentState {
            key: key.to_string(),
            detail: "shard is no longer managed".to_string(),
        })?;

        let stamp = manager
            .slot_manager(key.granularity)
            .and_then(|slots| slots.get(key.slot));
        if !stamp.is_some_and(|s| s.is_active()) {
            return Err(Error::InconsistentState {
                key: key.to_string(),
                detail: "slot is not active".to_string(),
            });
        }

        match Self::blocking_child(&manager, key, None) {
            Some(child) => Err(Error::InconsistentState {
                key: key.to_string(),
                detail: format!("finer slot {} is still active", child),
            }),
            None => Ok(()),
        }
    }

    /// Record a successful rollup of `unit`
    ///
    /// The slot becomes Rolled only if no newer write arrived while the unit
    /// ran; otherwise it stays Active and is picked up again.
    pub fn complete(&self, unit: &ScheduledUnit) {
        let rolled = self
            .shard_state_manager(unit.key.shard)
            .and_then(|m| {
                m.slot_manager(unit.key.granularity)
                    .map(|slots| slots.mark_rolled(unit.key.slot, unit.stamp_timestamp))
            })
            .unwrap_or(false);

        self.queue.lock().running.remove(&unit.key);

        if rolled {
            debug!(slot_key = %unit.key, "Slot rolled");
        } else {
            debug!(slot_key = %unit.key, "Slot changed during rollup, staying active");
        }
    }

    /// Release a failed unit; its slot stays Active
    ///
    /// With `immediate_retry` the unit goes back to the front of the queue,
    /// otherwise the next scheduling pass picks it up again.
    pub fn fail(&self, unit: &ScheduledUnit, immediate_retry: bool) {
        let mut queue = self.queue.lock();
        queue.running.remove(&unit.key);
        if immediate_retry && self.is_managed(unit.key.shard) {
            queue.push_front(unit.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Shard ownership
    // ------------------------------------------------------------------------

    /// Shards managed by this process, ascending
    pub fn managed_shards(&self) -> Vec<ShardId> {
        self.shards.read().keys().copied().collect()
    }

    /// Whether `shard` is managed here
    pub fn is_managed(&self, shard: ShardId) -> bool {
        self.shards.read().contains_key(&shard)
    }

    /// Start managing `shard`; returns its state manager
    ///
    /// Adding a shard that is already managed returns the existing manager.
    pub fn add_shard(&self, shard: ShardId) -> Arc<ShardStateManager> {
        let mut shards = self.shards.write();
        let manager = shards
            .entry(shard)
            .or_insert_with(|| {
                info!(shard, "Managing shard");
                Arc::new(ShardStateManager::new(shard))
            });
        Arc::clone(manager)
    }

    /// Stop managing `shard`, dropping its queued units
    ///
    /// Running units finish; completing them afterwards is a no-op.
    pub fn remove_shard(&self, shard: ShardId) -> Option<Arc<ShardStateManager>> {
        let removed = self.shards.write().remove(&shard)?;
        let mut queue = self.queue.lock();
        let WorkQueue {
            scheduled,
            scheduled_keys,
            ..
        } = &mut *queue;
        scheduled.retain(|unit| unit.key.shard != shard);
        scheduled_keys.retain(|key| key.shard != shard);
        info!(shard, "Stopped managing shard");
        Some(removed)
    }

    /// State manager of `shard`, if managed
    pub fn shard_state_manager(&self, shard: ShardId) -> Option<Arc<ShardStateManager>> {
        self.shards.read().get(&shard).cloned()
    }

    fn shard_snapshot(&self) -> Vec<Arc<ShardStateManager>> {
        self.shards.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Observability and repair
    // ------------------------------------------------------------------------

    /// Slots that are ready but not yet rolled, per granularity
    ///
    /// Counts queued and running units plus quiesced Active slots the next
    /// scheduling pass would queue. Slots still waiting on a finer slot are
    /// left out. Every rollup granularity is present in the result.
    pub fn backlog(&self) -> BTreeMap<Granularity, usize> {
        let now = self.current_time_millis();
        let shards = self.shard_snapshot();
        let queue = self.queue.lock();

        let mut backlog: BTreeMap<Granularity, usize> = Granularity::rollup_granularities()
            .iter()
            .map(|g| (*g, 0))
            .collect();

        for key in queue.scheduled_keys.iter().chain(queue.running.keys()) {
            *backlog.entry(key.granularity).or_default() += 1;
        }
        for manager in &shards {
            for slots in manager.slot_managers() {
                let waiting = slots
                    .quiesced_active(now, self.quiescence_delay_ms)
                    .into_iter()
                    .map(|(slot, _)| SlotKey::new(manager.shard(), slots.granularity(), slot))
                    .filter(|key| {
                        !queue.is_queued(key) && Self::blocking_child(manager, key, Some(&*queue)).is_none()
                    })
                    .count();
                *backlog.entry(slots.granularity()).or_default() += waiting;
            }
        }
        backlog
    }

    /// Active slots whose last write is older than `threshold`
    pub fn stuck_slots(&self, threshold: Duration) -> Vec<(SlotKey, UpdateStamp)> {
        let now = self.current_time_millis();
        let threshold_ms = threshold.as_millis() as i64;
        let mut stuck = Vec::new();
        for manager in self.shard_snapshot() {
            for slots in manager.slot_managers() {
                for (slot, stamp) in slots.active_older_than(now, threshold_ms) {
                    stuck.push((SlotKey::new(manager.shard(), slots.granularity(), slot), stamp));
                }
            }
        }
        if !stuck.is_empty() {
            warn!(count = stuck.len(), threshold_ms, "Slots stuck in active state");
        }
        stuck
    }

    /// Make a slot Active again so it is rolled up once more
    ///
    /// Every coarser slot covering it is reactivated too, so the repaired
    /// data cascades up like a late write would. Existing timestamps are
    /// kept, so long-rolled slots are eligible on the next pass. Returns
    /// whether the requested slot changed; `false` for unmanaged shards and
    /// raw granularity.
    pub fn force_reroll(&self, shard: ShardId, granularity: Granularity, slot: usize) -> bool {
        let Some(manager) = self.shard_state_manager(shard) else {
            return false;
        };
        let Some(slots) = manager.slot_manager(granularity) else {
            return false;
        };
        let now = self.current_time_millis();
        let fallback = now - self.quiescence_delay_ms - 1;
        let slot = slot % granularity.num_slots();
        let changed = slots.reactivate(slot, fallback);

        let range = granularity.derive_range(slot, now);
        let mut coarser = granularity.coarser();
        let mut parents = 0;
        while let Some(parent) = coarser {
            if let Some(parent_slots) = manager.slot_manager(parent) {
                if parent_slots.reactivate(parent.slot(range.start), fallback) {
                    parents += 1;
                }
            }
            coarser = parent.coarser();
        }

        info!(shard, granularity = %granularity, slot, changed, parents, "Forced reroll");
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;
    const DELAY: Duration = Duration::from_secs(5 * 60);
    // day-aligned start
    const START: i64 = 1_333_584_000_000;

    fn context(shards: &[ShardId]) -> ScheduleContext {
        ScheduleContext::new(START, shards.iter().copied(), DELAY)
    }

    fn drain(ctx: &ScheduleContext) -> Vec<ScheduledUnit> {
        std::iter::from_fn(|| ctx.next_scheduled()).collect()
    }

    #[test]
    fn test_slot_key_display() {
        let key = SlotKey::new(12, Granularity::Min20, 4);
        assert_eq!(key.to_string(), "metrics_20m,4,12");
        assert!(SlotKey::new(0, Granularity::Min5, 1).children().is_empty());
        assert_eq!(key.children().len(), 4);
    }

    #[test]
    fn test_update_ignores_unmanaged_shard() {
        let ctx = context(&[1]);
        ctx.update(START, 2);
        ctx.set_current_time_millis(START + 60 * MINUTE);
        assert_eq!(ctx.schedule_eligible_slots(), 0);
    }

    #[test]
    fn test_quiescence_delay_is_respected() {
        let ctx = context(&[0]);
        ctx.update(START, 0);

        ctx.set_current_time_millis(START + DELAY.as_millis() as i64);
        assert_eq!(ctx.schedule_eligible_slots(), 0);

        ctx.set_current_time_millis(START + DELAY.as_millis() as i64 + 1);
        assert_eq!(ctx.schedule_eligible_slots(), 1);
        let unit = ctx.next_scheduled().unwrap();
        assert_eq!(unit.key.granularity, Granularity::Min5);
        assert_eq!(unit.range, Granularity::Min5.range_for(START));
    }

    #[test]
    fn test_cascade_waits_for_finer_slots() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);

        for expected in Granularity::ROLLUP {
            assert_eq!(ctx.schedule_eligible_slots(), 1);
            let units = drain(&ctx);
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].key.granularity, expected);
            ctx.verify_ready(&units[0].key).unwrap();
            ctx.complete(&units[0]);
        }
        assert_eq!(ctx.schedule_eligible_slots(), 0);
        assert_eq!(ctx.running_count(), 0);
        assert!(ctx.backlog().values().all(|n| *n == 0));
    }

    #[test]
    fn test_no_double_scheduling() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);

        assert_eq!(ctx.schedule_eligible_slots(), 1);
        assert_eq!(ctx.schedule_eligible_slots(), 0);
        let unit = ctx.next_scheduled().unwrap();
        assert_eq!(ctx.running_count(), 1);
        // running units are not queued again
        assert_eq!(ctx.schedule_eligible_slots(), 0);
        ctx.fail(&unit, false);
        assert_eq!(ctx.running_count(), 0);
        assert_eq!(ctx.schedule_eligible_slots(), 1);
    }

    #[test]
    fn test_fail_with_immediate_retry_requeues_at_front() {
        let ctx = context(&[0, 1]);
        ctx.update(START, 0);
        ctx.update(START, 1);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        assert_eq!(ctx.schedule_eligible_slots(), 2);

        let first = ctx.next_scheduled().unwrap();
        ctx.fail(&first, true);
        assert_eq!(ctx.scheduled_count(), 2);
        assert_eq!(ctx.next_scheduled().unwrap().key, first.key);
        // still active
        assert!(ctx.verify_ready(&first.key).is_ok());
    }

    #[test]
    fn test_write_during_rollup_keeps_slot_active() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        ctx.schedule_eligible_slots();
        let unit = ctx.next_scheduled().unwrap();

        // a late sample for the same slot lands while the unit runs
        ctx.set_current_time_millis(START + 11 * MINUTE);
        ctx.update(START + 30_000, 0);
        ctx.complete(&unit);

        let manager = ctx.shard_state_manager(0).unwrap();
        assert!(manager.slot_manager(Granularity::Min5).unwrap().is_active(unit.key.slot));

        ctx.set_current_time_millis(START + 20 * MINUTE);
        assert_eq!(ctx.schedule_eligible_slots(), 1);
    }

    #[test]
    fn test_verify_ready_detects_active_child() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        ctx.schedule_eligible_slots();
        let five = ctx.next_scheduled().unwrap();
        ctx.complete(&five);
        ctx.schedule_eligible_slots();
        let twenty = ctx.next_scheduled().unwrap();
        assert_eq!(twenty.key.granularity, Granularity::Min20);

        // late data re-activates the 5m child before the 20m unit runs
        ctx.update(START, 0);
        let err = ctx.verify_ready(&twenty.key).unwrap_err();
        assert!(matches!(err, Error::InconsistentState { .. }));
        ctx.fail(&twenty, false);
    }

    #[test]
    fn test_shard_membership() {
        let ctx = context(&[3, 1]);
        assert_eq!(ctx.managed_shards(), vec![1, 3]);

        let added = ctx.add_shard(5);
        assert!(Arc::ptr_eq(&added, &ctx.add_shard(5)));
        assert_eq!(ctx.managed_shards(), vec![1, 3, 5]);

        ctx.update(START, 3);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        assert_eq!(ctx.schedule_eligible_slots(), 1);
        assert!(ctx.remove_shard(3).is_some());
        assert!(!ctx.has_scheduled());
        assert!(ctx.remove_shard(3).is_none());
    }

    #[test]
    fn test_backlog_counts_waiting_slots() {
        let ctx = context(&[0]);
        for minute in [0, 5, 10] {
            ctx.update(START + minute * MINUTE, 0);
        }
        ctx.set_current_time_millis(START + 30 * MINUTE);

        let backlog = ctx.backlog();
        assert_eq!(backlog.len(), 5);
        assert_eq!(backlog[&Granularity::Min5], 3);
        // coarser slots wait on their active 5m children
        assert_eq!(backlog[&Granularity::Min20], 0);

        ctx.schedule_eligible_slots();
        ctx.next_scheduled().unwrap();
        // queued and running slots still count
        assert_eq!(ctx.backlog()[&Granularity::Min5], 3);
        assert_eq!(ctx.backlog()[&Granularity::Min20], 0);
    }

    #[test]
    fn test_backlog_matches_what_scheduling_would_queue() {
        let ctx = context(&[0, 1]);
        ctx.update(START, 0);
        ctx.update(START + 25 * MINUTE, 1);
        ctx.set_current_time_millis(START + 60 * MINUTE);

        let waiting: usize = ctx.backlog().values().sum();
        assert_eq!(waiting, 2);
        assert_eq!(ctx.schedule_eligible_slots(), waiting);
        assert_eq!(ctx.backlog().values().sum::<usize>(), waiting);
    }

    #[test]
    fn test_stuck_slots() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 2 * 60 * MINUTE);
        let stuck = ctx.stuck_slots(Duration::from_secs(60 * 60));
        assert_eq!(stuck.len(), 5);
        assert!(ctx.stuck_slots(Duration::from_secs(3 * 60 * 60)).is_empty());
    }

    #[test]
    fn test_force_reroll() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        ctx.schedule_eligible_slots();
        let unit = ctx.next_scheduled().unwrap();
        ctx.complete(&unit);

        assert!(ctx.force_reroll(0, Granularity::Min5, unit.key.slot));
        assert!(!ctx.force_reroll(0, Granularity::Full, 0));
        assert!(!ctx.force_reroll(9, Granularity::Min5, 0));

        // coarser slots covering it are active again but wait for the 5m slot
        let manager = ctx.shard_state_manager(0).unwrap();
        for g in Granularity::ROLLUP {
            assert!(manager.slot_manager(g).unwrap().is_active(g.slot(START)));
        }
        assert_eq!(ctx.schedule_eligible_slots(), 1);
        assert_eq!(ctx.next_scheduled().unwrap().key, unit.key);
    }

    #[test]
    fn test_force_reroll_cascades_after_full_rollup() {
        let ctx = context(&[0]);
        ctx.update(START, 0);
        ctx.set_current_time_millis(START + 10 * MINUTE);
        for _ in Granularity::ROLLUP {
            ctx.schedule_eligible_slots();
            let unit = ctx.next_scheduled().unwrap();
            ctx.complete(&unit);
        }

        assert!(ctx.force_reroll(0, Granularity::Min20, Granularity::Min20.slot(START)));
        let manager = ctx.shard_state_manager(0).unwrap();
        assert!(!manager.slot_manager(Granularity::Min5).unwrap().is_active(Granularity::Min5.slot(START)));

        let mut rolled = Vec::new();
        while ctx.schedule_eligible_slots() > 0 {
            let unit = ctx.next_scheduled().unwrap();
            rolled.push(unit.key.granularity);
            ctx.complete(&unit);
        }
        assert_eq!(
            rolled,
            vec![Granularity::Min20, Granularity::Min60, Granularity::Min240, Granularity::Min1440]
        );
    }
}
