//! Granularity ladder
//!
//! Every granularity has a fixed slot width and a slot count per rotation.
//! All rotations span 14 days, so the slot index of a coarser granularity
//! maps onto a contiguous block of finer slot indexes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::range::Range;

const MINUTE_MS: i64 = 60 * 1000;

/// Slots in one rotation at 5-minute resolution (14 days)
pub const BASE_SLOTS_PER_GRANULARITY: usize = 4032;

/// One level of the resolution ladder, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    /// Raw samples
    Full,
    /// 5-minute rollups
    Min5,
    /// 20-minute rollups
    Min20,
    /// 60-minute rollups
    Min60,
    /// 240-minute rollups
    Min240,
    /// 1440-minute (daily) rollups
    Min1440,
}

impl Granularity {
    /// Every granularity, finest first
    pub const ALL: [Granularity; 6] = [
        Granularity::Full,
        Granularity::Min5,
        Granularity::Min20,
        Granularity::Min60,
        Granularity::Min240,
        Granularity::Min1440,
    ];

    /// Granularities that hold rollups and therefore slot state
    pub const ROLLUP: [Granularity; 5] = [
        Granularity::Min5,
        Granularity::Min20,
        Granularity::Min60,
        Granularity::Min240,
        Granularity::Min1440,
    ];

    /// Granularities that hold rollups, finest first
    pub fn rollup_granularities() -> &'static [Granularity] {
        &Self::ROLLUP
    }

    /// Slot width in milliseconds
    pub const fn milliseconds(self) -> i64 {
        match self {
            Granularity::Full => MINUTE_MS,
            Granularity::Min5 => 5 * MINUTE_MS,
            Granularity::Min20 => 20 * MINUTE_MS,
            Granularity::Min60 => 60 * MINUTE_MS,
            Granularity::Min240 => 240 * MINUTE_MS,
            Granularity::Min1440 => 1440 * MINUTE_MS,
        }
    }

    /// Number of slots in one rotation
    pub const fn num_slots(self) -> usize {
        match self {
            Granularity::Full => BASE_SLOTS_PER_GRANULARITY * 5,
            Granularity::Min5 => BASE_SLOTS_PER_GRANULARITY,
            Granularity::Min20 => BASE_SLOTS_PER_GRANULARITY / 4,
            Granularity::Min60 => BASE_SLOTS_PER_GRANULARITY / 12,
            Granularity::Min240 => BASE_SLOTS_PER_GRANULARITY / 48,
            Granularity::Min1440 => BASE_SLOTS_PER_GRANULARITY / 288,
        }
    }

    /// Length of one rotation in milliseconds
    pub const fn rotation_millis(self) -> i64 {
        self.milliseconds() * self.num_slots() as i64
    }

    /// Storage name of the granularity
    pub const fn name(self) -> &'static str {
        match self {
            Granularity::Full => "metrics_full",
            Granularity::Min5 => "metrics_5m",
            Granularity::Min20 => "metrics_20m",
            Granularity::Min60 => "metrics_60m",
            Granularity::Min240 => "metrics_240m",
            Granularity::Min1440 => "metrics_1440m",
        }
    }

    /// Short name used in config, logs and metric labels
    pub const fn short_name(self) -> &'static str {
        match self {
            Granularity::Full => "full",
            Granularity::Min5 => "5m",
            Granularity::Min20 => "20m",
            Granularity::Min60 => "60m",
            Granularity::Min240 => "240m",
            Granularity::Min1440 => "1440m",
        }
    }

    /// Next coarser level, `None` at the top of the ladder
    pub const fn coarser(self) -> Option<Granularity> {
        match self {
            Granularity::Full => Some(Granularity::Min5),
            Granularity::Min5 => Some(Granularity::Min20),
            Granularity::Min20 => Some(Granularity::Min60),
            Granularity::Min60 => Some(Granularity::Min240),
            Granularity::Min240 => Some(Granularity::Min1440),
            Granularity::Min1440 => None,
        }
    }

    /// Next finer level, `None` for raw data
    pub const fn finer(self) -> Option<Granularity> {
        match self {
            Granularity::Full => None,
            Granularity::Min5 => Some(Granularity::Full),
            Granularity::Min20 => Some(Granularity::Min5),
            Granularity::Min60 => Some(Granularity::Min20),
            Granularity::Min240 => Some(Granularity::Min60),
            Granularity::Min1440 => Some(Granularity::Min240),
        }
    }

    /// Whether this level holds rollups (everything but raw)
    pub const fn is_rollup(self) -> bool {
        !matches!(self, Granularity::Full)
    }

    /// Slot index containing `millis`
    pub fn slot(self, millis: i64) -> usize {
        millis
            .div_euclid(self.milliseconds())
            .rem_euclid(self.num_slots() as i64) as usize
    }

    /// Snap `millis` down to the start of its slot
    pub fn snap_millis(self, millis: i64) -> i64 {
        millis - millis.rem_euclid(self.milliseconds())
    }

    /// Range of the slot containing `millis`
    pub fn range_for(self, millis: i64) -> Range {
        let start = self.snap_millis(millis);
        Range::new(start, start + self.milliseconds())
    }

    /// Range of the most recent occurrence of `slot` at or before `reference_millis`
    pub fn derive_range(self, slot: usize, reference_millis: i64) -> Range {
        let reference = self.snap_millis(reference_millis);
        let reference_slot = self.slot(reference);
        let slot_diff = if slot > reference_slot {
            self.num_slots() - slot + reference_slot
        } else {
            reference_slot - slot
        };
        let start = reference - slot_diff as i64 * self.milliseconds();
        Range::new(start, start + self.milliseconds())
    }

    /// Slot indexes of the next finer granularity covered by `slot`
    ///
    /// Empty for raw data. Relies on every rotation spanning the same length.
    pub fn finer_slots(self, slot: usize) -> std::ops::Range<usize> {
        match self.finer() {
            Some(finer) => {
                let ratio = (self.milliseconds() / finer.milliseconds()) as usize;
                slot * ratio..(slot + 1) * ratio
            },
            None => 0..0,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::ALL
            .iter()
            .copied()
            .find(|g| g.name() == s || g.short_name() == s)
            .ok_or_else(|| format!("Unknown granularity: {}", s))
    }
}
