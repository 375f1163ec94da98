//! Core data types used throughout the rollup core
//!
//! # Key Types
//!
//! - **`Locator`**: Tenant-scoped identifier of one metric series
//! - **`SimpleNumber`**: Raw numeric sample value (integer or float)
//! - **`Sample`**: One raw observation for a locator
//! - **`Points<T>`**: Timestamp-ordered data read back for a range
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::types::{Locator, Points, SimpleNumber};
//!
//! let locator = Locator::from_path_components("ac123", &["web", "cpu", "idle"]);
//! assert_eq!(locator.to_string(), "ac123.web.cpu.idle");
//!
//! let mut points = Points::new();
//! points.add(1_000, SimpleNumber::Integer(4));
//! points.add(2_000, SimpleNumber::Double(2.5));
//! assert_eq!(points.len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Shard identifier
pub type ShardId = u32;

/// Default number of shards locators are spread over
pub const DEFAULT_SHARD_COUNT: u32 = 128;

/// Separator between tenant and metric path components
pub const LOCATOR_SEPARATOR: &str = ".";

static SHARD_HASH: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

// ============================================================================
// Locator
// ============================================================================

/// Identifier of one metric time series: tenant plus metric path
///
/// Locators are immutable once built. Ordering is by tenant then path so that
/// serialized sets of locators are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locator {
    tenant_id: String,
    metric_name: String,
}

impl Locator {
    /// Create a locator from a tenant and an already-joined metric path
    pub fn new(tenant_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            metric_name: metric_name.into(),
        }
    }

    /// Create a locator from path components, joined with [`LOCATOR_SEPARATOR`]
    pub fn from_path_components(tenant_id: &str, components: &[&str]) -> Self {
        Self::new(tenant_id, components.join(LOCATOR_SEPARATOR))
    }

    /// Tenant owning the series
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Metric path within the tenant
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Stable shard for this locator among `shard_count` shards
    ///
    /// The hash is CRC-32C over the string form, so every process computes
    /// the same shard for the same locator.
    pub fn shard(&self, shard_count: u32) -> ShardId {
        let mut digest = SHARD_HASH.digest();
        digest.update(self.tenant_id.as_bytes());
        digest.update(LOCATOR_SEPARATOR.as_bytes());
        digest.update(self.metric_name.as_bytes());
        digest.finalize() % shard_count.max(1)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.tenant_id, LOCATOR_SEPARATOR, self.metric_name)
    }
}

// ============================================================================
// Sample values
// ============================================================================

/// A raw sample value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SimpleNumber {
    /// Integral sample (counters, gauges reported as integers)
    Integer(i64),
    /// Floating-point sample
    Double(f64),
}

impl SimpleNumber {
    /// Value widened to f64
    pub fn as_f64(&self) -> f64 {
        match *self {
            SimpleNumber::Integer(v) => v as f64,
            SimpleNumber::Double(v) => v,
        }
    }

    /// Whether the sample carries a floating-point value
    pub fn is_floating_point(&self) -> bool {
        matches!(self, SimpleNumber::Double(_))
    }
}

impl From<i64> for SimpleNumber {
    fn from(v: i64) -> Self {
        SimpleNumber::Integer(v)
    }
}

impl From<f64> for SimpleNumber {
    fn from(v: f64) -> Self {
        SimpleNumber::Double(v)
    }
}

/// One raw observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Series the sample belongs to
    pub locator: Locator,
    /// Observed value
    pub value: SimpleNumber,
    /// Collection time in milliseconds since the epoch
    pub timestamp_ms: i64,
    /// How long raw data is retained
    pub ttl: Duration,
    /// Unit label, e.g. "ms" or "bytes"
    pub unit: String,
}

impl Sample {
    /// Create a sample with a one-day TTL and an "unknown" unit
    pub fn new(locator: Locator, value: impl Into<SimpleNumber>, timestamp_ms: i64) -> Self {
        Self {
            locator,
            value: value.into(),
            timestamp_ms,
            ttl: Duration::from_secs(24 * 60 * 60),
            unit: "unknown".to_string(),
        }
    }

    /// Set the retention duration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the unit label
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

// ============================================================================
// Points
// ============================================================================

/// Timestamp-ordered data for one locator and range
///
/// Later writes at the same timestamp replace earlier ones, matching the
/// column semantics of the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Points<T> {
    points: BTreeMap<i64, T>,
}

impl<T> Points<T> {
    /// Create an empty set of points
    pub fn new() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }

    /// Add a point, replacing any existing point at the same timestamp
    pub fn add(&mut self, timestamp: i64, value: T) {
        self.points.insert(timestamp, value);
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether there are no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate `(timestamp, value)` in timestamp order
    pub fn iter(&self) -> btree_map::Iter<'_, i64, T> {
        self.points.iter()
    }

    /// Iterate values in timestamp order
    pub fn values(&self) -> btree_map::Values<'_, i64, T> {
        self.points.values()
    }

    /// Iterate timestamps in order
    pub fn timestamps(&self) -> btree_map::Keys<'_, i64, T> {
        self.points.keys()
    }

    /// Convert every value, keeping timestamps
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Points<U> {
        Points {
            points: self.points.into_iter().map(|(ts, v)| (ts, f(v))).collect(),
        }
    }
}

impl<T> Default for Points<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(i64, T)> for Points<T> {
    fn from_iter<I: IntoIterator<Item = (i64, T)>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for Points<T> {
    type Item = (i64, T);
    type IntoIter = btree_map::IntoIter<i64, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Points<T> {
    type Item = (&'a i64, &'a T);
    type IntoIter = btree_map::Iter<'a, i64, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}
