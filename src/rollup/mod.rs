//! Rollup algebra
//!
//! Two mergeable aggregate kinds summarise a slot of data:
//!
//! - **[`BasicRollup`]**: count, mean, min, max and variance
//! - **[`HistogramRollup`]**: bounded approximate frequency histogram
//!
//! Both are built either from raw samples or from rollups of the next finer
//! granularity. The [`Rollup`] trait is the capability interface the rollup
//! service drives; callers pick the kind explicitly.
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::rollup::{BasicRollup, Rollup};
//! use kuba_rollup::types::{Points, SimpleNumber};
//!
//! let raw: Points<SimpleNumber> = (0..10)
//!     .map(|i| (i * 1000, SimpleNumber::Integer(i)))
//!     .collect();
//! let rollup = BasicRollup::build_from_raw_samples(&raw).unwrap();
//! assert_eq!(rollup.count(), 10);
//! assert_eq!(rollup.mean(), 4.5);
//! ```

pub mod basic;
pub mod granularity;
pub mod histogram;
pub mod range;

pub use basic::BasicRollup;
pub use granularity::Granularity;
pub use histogram::{Bin, HistogramRollup, MAX_BIN_SIZE};
pub use range::{Range, RangeIter};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RollupError;
use crate::types::{Points, SimpleNumber};

/// Kind of rollup, used to address storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupType {
    /// Statistical summary
    Basic,
    /// Approximate histogram
    Histogram,
}

impl RollupType {
    /// Every rollup kind computed for a slot
    pub const ALL: [RollupType; 2] = [RollupType::Basic, RollupType::Histogram];

    /// Name used in logs and metric labels
    pub const fn name(self) -> &'static str {
        match self {
            RollupType::Basic => "basic",
            RollupType::Histogram => "histogram",
        }
    }
}

impl fmt::Display for RollupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A rollup as held by storage, tagged with its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredRollup {
    /// Statistical summary
    Basic(BasicRollup),
    /// Approximate histogram
    Histogram(HistogramRollup),
}

impl StoredRollup {
    /// Kind of the stored rollup
    pub fn rollup_type(&self) -> RollupType {
        match self {
            StoredRollup::Basic(_) => RollupType::Basic,
            StoredRollup::Histogram(_) => RollupType::Histogram,
        }
    }
}

/// Capability interface implemented by every rollup kind
///
/// `build_from_rollups` over a partition of a range must agree with
/// `build_from_raw_samples` over the whole range, exactly for counts and
/// within the kind's documented tolerance otherwise.
pub trait Rollup: Sized + Clone + Send + Sync + 'static {
    /// Storage kind of this rollup
    const TYPE: RollupType;

    /// Aggregate raw samples
    ///
    /// Fails with [`RollupError::EmptyInput`] on empty input.
    fn build_from_raw_samples(points: &Points<SimpleNumber>) -> Result<Self, RollupError>;

    /// Merge rollups of a finer granularity
    ///
    /// Fails with [`RollupError::EmptyInput`] on empty input.
    fn build_from_rollups(points: &Points<Self>) -> Result<Self, RollupError>;

    /// Number of samples summarised
    fn sample_count(&self) -> u64;

    /// Wrap for storage
    fn into_stored(self) -> StoredRollup;

    /// Unwrap from storage, failing when the stored kind differs
    fn from_stored(stored: StoredRollup) -> Result<Self, RollupError>;
}

impl Rollup for BasicRollup {
    const TYPE: RollupType = RollupType::Basic;

    fn build_from_raw_samples(points: &Points<SimpleNumber>) -> Result<Self, RollupError> {
        BasicRollup::build_from_raw_samples(points)
    }

    fn build_from_rollups(points: &Points<Self>) -> Result<Self, RollupError> {
        BasicRollup::build_from_rollups(points)
    }

    fn sample_count(&self) -> u64 {
        self.count()
    }

    fn into_stored(self) -> StoredRollup {
        StoredRollup::Basic(self)
    }

    fn from_stored(stored: StoredRollup) -> Result<Self, RollupError> {
        match stored {
            StoredRollup::Basic(rollup) => Ok(rollup),
            other => Err(RollupError::TypeMismatch {
                expected: RollupType::Basic.name(),
                actual: other.rollup_type().name(),
            }),
        }
    }
}

impl Rollup for HistogramRollup {
    const TYPE: RollupType = RollupType::Histogram;

    fn build_from_raw_samples(points: &Points<SimpleNumber>) -> Result<Self, RollupError> {
        HistogramRollup::build_from_raw_samples(points)
    }

    fn build_from_rollups(points: &Points<Self>) -> Result<Self, RollupError> {
        HistogramRollup::build_from_rollups(points)
    }

    fn sample_count(&self) -> u64 {
        self.count()
    }

    fn into_stored(self) -> StoredRollup {
        StoredRollup::Histogram(self)
    }

    fn from_stored(stored: StoredRollup) -> Result<Self, RollupError> {
        match stored {
            StoredRollup::Histogram(rollup) => Ok(rollup),
            other => Err(RollupError::TypeMismatch {
                expected: RollupType::Histogram.name(),
                actual: other.rollup_type().name(),
            }),
        }
    }
}

/// Convert stored rollups to one kind, failing on the first mismatch
pub fn typed_points<R: Rollup>(points: Points<StoredRollup>) -> Result<Points<R>, RollupError> {
    points
        .into_iter()
        .map(|(ts, stored)| R::from_stored(stored).map(|r| (ts, r)))
        .collect()
}
