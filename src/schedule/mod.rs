//! Rollup scheduling
//!
//! [`ScheduleContext`] owns the slot state of every shard this process
//! manages and decides which slots are ready to be rolled up. Work is handed
//! out as [`ScheduledUnit`]s; the caller reports back with
//! [`ScheduleContext::complete`] or [`ScheduleContext::fail`].

pub mod context;

pub use context::{ScheduleContext, ScheduledUnit, SlotKey};
