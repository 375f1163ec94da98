//! Per-slot update stamps and the coalescing rule

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    /// Data has been written since the last rollup
    Active,
    /// The slot has been aggregated
    Rolled,
}

impl SlotState {
    /// Name used in logs and persisted state
    pub const fn name(self) -> &'static str {
        match self {
            SlotState::Active => "active",
            SlotState::Rolled => "rolled",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last known state of a slot
///
/// `dirty` marks stamps that changed since the last successful push to the
/// shard state store. It is local bookkeeping and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStamp {
    timestamp: i64,
    state: SlotState,
    #[serde(skip)]
    dirty: bool,
}

impl UpdateStamp {
    /// A stamp that has not yet been persisted
    pub fn new(timestamp: i64, state: SlotState) -> Self {
        Self {
            timestamp,
            state,
            dirty: true,
        }
    }

    /// Active stamp observed at `timestamp`
    pub fn active(timestamp: i64) -> Self {
        Self::new(timestamp, SlotState::Active)
    }

    /// Rolled stamp at `timestamp`
    pub fn rolled(timestamp: i64) -> Self {
        Self::new(timestamp, SlotState::Rolled)
    }

    /// Same stamp, flagged as already persisted
    pub fn clean(mut self) -> Self {
        self.dirty = false;
        self
    }

    /// Observation time of the last update
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Current state
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Whether the slot holds data not yet rolled up
    pub fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    /// Whether the stamp changed since the last push
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Same timestamp and state, ignoring the dirty flag
    pub fn same_as(&self, other: &UpdateStamp) -> bool {
        self.timestamp == other.timestamp && self.state == other.state
    }

    /// Whether `incoming` should replace `self`
    ///
    /// A strictly newer stamp always wins. At equal timestamps Active beats
    /// Rolled, so a write seen concurrently with a completion is never lost.
    /// Everything else is discarded.
    pub fn is_superseded_by(&self, incoming: &UpdateStamp) -> bool {
        incoming.timestamp > self.timestamp
            || (incoming.timestamp == self.timestamp
                && incoming.state == SlotState::Active
                && self.state == SlotState::Rolled)
    }
}

/// Merge `incoming` into `stored`, returning the stamp to keep
///
/// Total and deterministic: the result only depends on the two stamps, and
/// applying the same incoming stamp twice is the same as applying it once.
pub fn coalesce(stored: Option<&UpdateStamp>, incoming: UpdateStamp) -> Option<UpdateStamp> {
    match stored {
        Some(current) if !current.is_superseded_by(&incoming) => None,
        _ => Some(incoming),
    }
}

/// Merge rule of shard state stores
///
/// Same as [`coalesce`], except that a Rolled stamp replaces a stored Active
/// stamp with the same timestamp. A completion is pushed as Rolled at the
/// timestamp of the Active stamp it rolled, mirroring
/// [`SlotStateManager::mark_rolled`](super::SlotStateManager::mark_rolled).
pub fn merge_persisted(stored: Option<&UpdateStamp>, incoming: UpdateStamp) -> Option<UpdateStamp> {
    match stored {
        Some(current)
            if current.is_active()
                && incoming.state == SlotState::Rolled
                && incoming.timestamp == current.timestamp =>
        {
            Some(incoming)
        },
        _ => coalesce(stored, incoming),
    }
}
