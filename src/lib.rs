//! Kuba Rollup - rollup aggregation and slot scheduling for a sharded
//! time-series store
//!
//! This library provides:
//! - A fixed ladder of granularities (raw, 5m, 20m, 60m, 240m, 1440m) with
//!   slot arithmetic over a 14-day rotation
//! - Mergeable basic (count, mean, variance, min, max) and histogram rollups
//! - Per-shard slot state with coalescing update stamps
//! - A schedule context that decides which slots are ready to roll up
//! - Background services rolling up slots and syncing shard state
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use kuba_rollup::engine::InMemoryStore;
//! use kuba_rollup::ingestion::SampleWriter;
//! use kuba_rollup::schedule::ScheduleContext;
//! use kuba_rollup::services::{RollupService, RollupServiceConfig};
//! use kuba_rollup::types::{Locator, Sample};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> kuba_rollup::Result<()> {
//! let start = 1_333_584_000_000;
//! let store = Arc::new(InMemoryStore::new(1));
//! let context = Arc::new(ScheduleContext::new(start, vec![0], Duration::from_secs(300)));
//! let writer = SampleWriter::new(store.clone(), context.clone(), 1);
//!
//! writer.write(&Sample::new(Locator::new("ac1", "cpu.idle"), 42i64, start)).await?;
//! context.set_current_time_millis(start + 3_600_000);
//!
//! let service = RollupService::new(RollupServiceConfig::default(), context, store);
//! let report = service.run_until_idle(10).await;
//! assert_eq!(report.completed, 5);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod rollup;
pub mod state;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Slot scheduling: which slots are ready to be rolled up
pub mod schedule;

/// Raw sample writes and the notifications that mark slots Active
pub mod ingestion;

/// Background services for rolling up slots and syncing shard state
/// Provides service lifecycle management, graceful shutdown, and dependency ordering
pub mod services;

// Re-export main types
pub use error::{Error, Result};
pub use rollup::{BasicRollup, Granularity, HistogramRollup, Range, Rollup, RollupType};
pub use schedule::{ScheduleContext, ScheduledUnit, SlotKey};
pub use types::{Locator, Points, Sample, ShardId, SimpleNumber};
