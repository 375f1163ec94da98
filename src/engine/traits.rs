//! Storage interfaces consumed by the rollup core

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, StorageError};
use crate::rollup::{typed_points, Granularity, Range, Rollup, RollupType, StoredRollup};
use crate::state::ShardStateMap;
use crate::types::{Locator, Points, Sample, ShardId, SimpleNumber};

// =============================================================================
// MetricStore Trait
// =============================================================================

/// Durable store of raw samples and rollups
///
/// Implementations must make `write_rollups` idempotent: writing the same
/// rollup for the same (locator, granularity, timestamp) twice leaves one
/// value.
#[async_trait]
pub trait MetricStore: Send + Sync + 'static {
    /// Raw samples of `locator` with timestamps in `range`
    async fn read_raw(
        &self,
        locator: &Locator,
        range: Range,
    ) -> std::result::Result<Points<SimpleNumber>, StorageError>;

    /// Stored rollups of one kind for `locator` at `granularity` within `range`
    async fn read_rollups(
        &self,
        locator: &Locator,
        range: Range,
        granularity: Granularity,
        rollup_type: RollupType,
    ) -> std::result::Result<Points<StoredRollup>, StorageError>;

    /// Write a batch of rollups
    async fn write_rollups(&self, writes: Vec<RollupWrite>) -> std::result::Result<(), StorageError>;

    /// Write one raw sample
    async fn write_raw_sample(&self, sample: &Sample) -> std::result::Result<(), StorageError>;

    /// Locators that belong to `shard`
    async fn locators_for_shard(
        &self,
        shard: ShardId,
    ) -> std::result::Result<BTreeSet<Locator>, StorageError>;
}

/// Read rollups of kind `R`
///
/// Fails with a type mismatch when storage holds another kind at one of the
/// timestamps.
pub async fn read_rollups_as<R: Rollup>(
    store: &dyn MetricStore,
    locator: &Locator,
    range: Range,
    granularity: Granularity,
) -> Result<Points<R>> {
    let stored = store.read_rollups(locator, range, granularity, R::TYPE).await?;
    Ok(typed_points(stored)?)
}

/// One rollup to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupWrite {
    /// Series the rollup summarises
    pub locator: Locator,
    /// Granularity of the rollup
    pub granularity: Granularity,
    /// Start of the slot the rollup covers
    pub timestamp: i64,
    /// The rollup itself
    pub rollup: StoredRollup,
}

impl RollupWrite {
    /// Create a write for a typed rollup
    pub fn new<R: Rollup>(locator: Locator, granularity: Granularity, timestamp: i64, rollup: R) -> Self {
        Self {
            locator,
            granularity,
            timestamp,
            rollup: rollup.into_stored(),
        }
    }

    /// Kind of the rollup being written
    pub fn rollup_type(&self) -> RollupType {
        self.rollup.rollup_type()
    }
}

// =============================================================================
// ShardStateStore Trait
// =============================================================================

/// Durable store of per-shard slot state, shared by all processes
#[async_trait]
pub trait ShardStateStore: Send + Sync + 'static {
    /// Merge `state` into the persisted state of `shard`
    ///
    /// Persisted stamps are merged with
    /// [`merge_persisted`](crate::state::merge_persisted), so concurrent
    /// pushes from several processes converge.
    async fn persist_shard_state(
        &self,
        shard: ShardId,
        state: &ShardStateMap,
    ) -> std::result::Result<(), StorageError>;

    /// Persisted state of `shard`; empty when nothing was stored yet
    async fn load_shard_state(&self, shard: ShardId) -> std::result::Result<ShardStateMap, StorageError>;
}
