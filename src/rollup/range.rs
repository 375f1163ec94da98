//! Slot-aligned time ranges and the rollup range iterator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::FusedIterator;

use super::granularity::Granularity;

/// Half-open time interval `[start, stop)` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive start
    pub start: i64,
    /// Exclusive stop
    pub stop: i64,
}

impl Range {
    /// Create a range; `stop` must not precede `start`
    pub fn new(start: i64, stop: i64) -> Self {
        debug_assert!(start <= stop, "range start {} > stop {}", start, stop);
        Self { start, stop }
    }

    /// Whether `millis` falls inside the range
    pub fn contains(&self, millis: i64) -> bool {
        millis >= self.start && millis < self.stop
    }

    /// Width of the range
    pub fn duration_ms(&self) -> i64 {
        self.stop - self.start
    }

    /// Ranges of every `granularity` slot intersecting `[start_millis, stop_millis)`
    ///
    /// The first range starts at or before `start_millis` and the last one
    /// stops at or after `stop_millis`. A `stop_millis` on a slot boundary is
    /// exclusive; an empty span yields the single slot containing
    /// `start_millis`; a reversed span yields nothing. The iterator is lazy and
    /// cloning it restarts the sequence.
    pub fn ranges_to_rollup(granularity: Granularity, start_millis: i64, stop_millis: i64) -> RangeIter {
        let width = granularity.milliseconds();
        let first = granularity.snap_millis(start_millis);

        if stop_millis < start_millis {
            return RangeIter {
                width,
                next_start: first,
                remaining: 0,
            };
        }

        let last = if stop_millis == start_millis {
            first
        } else {
            granularity.snap_millis(stop_millis - 1)
        };

        RangeIter {
            width,
            next_start: first,
            remaining: ((last - first) / width + 1) as usize,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Lazy iterator over consecutive slot ranges of one granularity
#[derive(Debug, Clone)]
pub struct RangeIter {
    width: i64,
    next_start: i64,
    remaining: usize,
}

impl Iterator for RangeIter {
    type Item = Range;

    fn next(&mut self) -> Option<Range> {
        if self.remaining == 0 {
            return None;
        }
        let range = Range::new(self.next_start, self.next_start + self.width);
        self.next_start += self.width;
        self.remaining -= 1;
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RangeIter {}

impl FusedIterator for RangeIter {}
