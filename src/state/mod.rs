//! Slot state tracking
//!
//! Every (shard, rollup granularity, slot) has an [`UpdateStamp`] saying
//! whether the slot holds data that still needs rolling up. Stamps only
//! change through coalescing, which makes concurrent updates from ingestion,
//! rollup completion and persisted state commute.

pub mod shard_manager;
pub mod slot_manager;
pub mod stamp;

pub use shard_manager::{ShardStateManager, ShardStateMap};
pub use slot_manager::SlotStateManager;
pub use stamp::{coalesce, merge_persisted, SlotState, UpdateStamp};
