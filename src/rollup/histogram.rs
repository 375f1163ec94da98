//! Bounded approximate histogram
//!
//! Every distinct sample value starts as its own bin. While there are more
//! than [`MAX_BIN_SIZE`] bins, the adjacent pair with the smallest gap between
//! their means is replaced by one bin at the count-weighted mean. When two
//! gaps are equal the pair with the lower values merges first, so the result
//! only depends on the multiset of inputs.
//!
//! Merging histograms concatenates all bins and runs the same reduction. The
//! total count is always exact; bin positions are approximate.

use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::RollupError;
use crate::types::{Points, SimpleNumber};

/// Maximum number of bins kept per histogram
pub const MAX_BIN_SIZE: usize = 64;

const KIND: &str = "histogram";

/// One histogram bin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    /// Count-weighted mean of the values in the bin
    pub mean: f64,
    /// Number of values in the bin
    pub count: u64,
}

impl Bin {
    fn absorb(&mut self, other: &Bin) {
        let total = self.count + other.count;
        self.mean += (other.mean - self.mean) * other.count as f64 / total as f64;
        self.count = total;
    }
}

/// Histogram of at most [`MAX_BIN_SIZE`] bins, ordered by mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramRollup {
    bins: Vec<Bin>,
}

impl HistogramRollup {
    /// Build from raw samples
    pub fn build_from_raw_samples(points: &Points<SimpleNumber>) -> Result<Self, RollupError> {
        if points.is_empty() {
            return Err(RollupError::EmptyInput { kind: KIND });
        }
        let bins = points
            .values()
            .map(|v| Bin {
                mean: v.as_f64(),
                count: 1,
            })
            .collect();
        Ok(Self {
            bins: reduce_bins(bins, MAX_BIN_SIZE),
        })
    }

    /// Merge finer histograms
    pub fn build_from_rollups(points: &Points<HistogramRollup>) -> Result<Self, RollupError> {
        if points.is_empty() {
            return Err(RollupError::EmptyInput { kind: KIND });
        }
        let bins = points
            .values()
            .flat_map(|h| h.bins.iter().copied())
            .collect();
        Ok(Self {
            bins: reduce_bins(bins, MAX_BIN_SIZE),
        })
    }

    /// Bins ordered by mean
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Total number of samples across bins
    pub fn count(&self) -> u64 {
        self.bins.iter().map(|b| b.count).sum()
    }

    /// Count-weighted mean of all bins
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.bins
            .iter()
            .map(|b| b.mean * b.count as f64)
            .sum::<f64>()
            / count as f64
    }
}

// ============================================================================
// Reduction
// ============================================================================

/// Candidate merge of two neighbouring bins
///
/// `left_version`/`right_version` detect entries made stale by an earlier
/// merge touching either side.
#[derive(Debug)]
struct Candidate {
    gap: f64,
    left: usize,
    right: usize,
    left_version: u32,
    right_version: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gap
            .total_cmp(&other.gap)
            .then(self.left.cmp(&other.left))
    }
}

/// Sort, collapse equal means, then merge closest neighbours down to `max_bins`
fn reduce_bins(mut bins: Vec<Bin>, max_bins: usize) -> Vec<Bin> {
    bins.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    bins.dedup_by(|next, kept| {
        if next.mean.total_cmp(&kept.mean) == Ordering::Equal {
            kept.count += next.count;
            true
        } else {
            false
        }
    });

    let max_bins = max_bins.max(1);
    let n = bins.len();
    if n <= max_bins {
        return bins;
    }

    let mut prev: Vec<Option<usize>> = (0..n).map(|i| i.checked_sub(1)).collect();
    let mut next: Vec<Option<usize>> = (0..n).map(|i| (i + 1 < n).then_some(i + 1)).collect();
    let mut alive = vec![true; n];
    let mut version = vec![0u32; n];

    let candidate = |bins: &[Bin], version: &[u32], left: usize, right: usize| Candidate {
        gap: bins[right].mean - bins[left].mean,
        left,
        right,
        left_version: version[left],
        right_version: version[right],
    };

    let mut heap: BinaryHeap<Reverse<Candidate>> = (0..n - 1)
        .map(|i| Reverse(candidate(&bins, &version, i, i + 1)))
        .collect();

    let mut live = n;
    while live > max_bins {
        let Some(Reverse(c)) = heap.pop() else {
            break;
        };
        if !alive[c.left]
            || !alive[c.right]
            || version[c.left] != c.left_version
            || version[c.right] != c.right_version
        {
            continue;
        }

        let absorbed = bins[c.right];
        bins[c.left].absorb(&absorbed);
        alive[c.right] = false;
        version[c.left] += 1;
        live -= 1;

        next[c.left] = next[c.right];
        if let Some(after) = next[c.right] {
            prev[after] = Some(c.left);
        }

        if let Some(before) = prev[c.left] {
            heap.push(Reverse(candidate(&bins, &version, before, c.left)));
        }
        if let Some(after) = next[c.left] {
            heap.push(Reverse(candidate(&bins, &version, c.left, after)));
        }
    }

    bins.into_iter()
        .zip(alive)
        .filter_map(|(bin, alive)| alive.then_some(bin))
        .collect()
}
