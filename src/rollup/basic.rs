//! Statistical rollup: count, mean, min, max and population variance
//!
//! Raw samples go through a single pass with widened accumulators. Integer
//! samples are summed exactly in `i128`; floats (or integer sums that would
//! overflow even that) fall back to Welford's online update. Rollups merge
//! with the parallel variance formula (Chan et al.), so chaining merges
//! 5m → 20m → 60m gives the same answer as merging all 5m rollups at once.

use serde::{Deserialize, Serialize};

use crate::error::RollupError;
use crate::types::{Points, SimpleNumber};

const KIND: &str = "basic";

/// Summary statistics of one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicRollup {
    count: u64,
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
}

impl BasicRollup {
    /// Aggregate raw samples
    pub fn build_from_raw_samples(points: &Points<SimpleNumber>) -> Result<Self, RollupError> {
        let mut acc = RawAccumulator::new();
        for value in points.values() {
            acc.add(*value);
        }
        acc.finish()
    }

    /// Merge finer rollups
    pub fn build_from_rollups(points: &Points<BasicRollup>) -> Result<Self, RollupError> {
        let mut merged: Option<MergeState> = None;
        for rollup in points.values() {
            match merged.as_mut() {
                Some(state) => state.merge(rollup),
                None => merged = Some(MergeState::from(rollup)),
            }
        }
        merged
            .map(MergeState::finish)
            .ok_or(RollupError::EmptyInput { kind: KIND })
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Arithmetic mean
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Population standard deviation
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Smallest sample
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sum of all samples
    pub fn sum(&self) -> f64 {
        self.mean * self.count as f64
    }
}

// ============================================================================
// Raw accumulation
// ============================================================================

struct RawAccumulator {
    count: u64,
    min: f64,
    max: f64,
    /// Exact sums while every sample is an integer and nothing overflowed
    exact: Option<(i128, i128)>,
    welford_mean: f64,
    welford_m2: f64,
}

impl RawAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            exact: Some((0, 0)),
            welford_mean: 0.0,
            welford_m2: 0.0,
        }
    }

    fn add(&mut self, value: SimpleNumber) {
        let v = value.as_f64();
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);

        self.exact = match (self.exact, value) {
            (Some((sum, sum_sq)), SimpleNumber::Integer(i)) => {
                let i = i as i128;
                sum.checked_add(i)
                    .zip(i.checked_mul(i).and_then(|sq| sum_sq.checked_add(sq)))
            },
            _ => None,
        };

        let delta = v - self.welford_mean;
        self.welford_mean += delta / self.count as f64;
        self.welford_m2 += delta * (v - self.welford_mean);
    }

    fn finish(self) -> Result<BasicRollup, RollupError> {
        if self.count == 0 {
            return Err(RollupError::EmptyInput { kind: KIND });
        }

        let (mean, variance) = self
            .exact_moments()
            .unwrap_or((self.welford_mean, self.welford_m2 / self.count as f64));

        Ok(BasicRollup {
            count: self.count,
            mean,
            variance,
            min: self.min,
            max: self.max,
        })
    }

    /// Mean and variance from the exact integer sums, if they are still valid
    fn exact_moments(&self) -> Option<(f64, f64)> {
        let (sum, sum_sq) = self.exact?;
        let n = self.count as i128;
        // n * sum_sq - sum^2 == n^2 * variance, exactly
        let scaled = n.checked_mul(sum_sq)?.checked_sub(sum.checked_mul(sum)?)?;
        let n_sq = n.checked_mul(n)?;
        Some((
            sum as f64 / self.count as f64,
            scaled as f64 / n_sq as f64,
        ))
    }
}

// ============================================================================
// Rollup merging
// ============================================================================

struct MergeState {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl From<&BasicRollup> for MergeState {
    fn from(rollup: &BasicRollup) -> Self {
        Self {
            count: rollup.count,
            mean: rollup.mean,
            m2: rollup.variance * rollup.count as f64,
            min: rollup.min,
            max: rollup.max,
        }
    }
}

impl MergeState {
    fn merge(&mut self, other: &BasicRollup) {
        if other.count == 0 {
            return;
        }
        let combined = self.count + other.count;
        let delta = other.mean - self.mean;
        let (n_a, n_b, n) = (self.count as f64, other.count as f64, combined as f64);

        self.mean += delta * n_b / n;
        self.m2 += other.variance * n_b + delta * delta * n_a * n_b / n;
        self.count = combined;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn finish(self) -> BasicRollup {
        let variance = if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        };
        BasicRollup {
            count: self.count,
            mean: self.mean,
            variance,
            min: self.min,
            max: self.max,
        }
    }
}
