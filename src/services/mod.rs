//! Background Services Module
//!
//! Long-running tasks of a rollup process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  pull / push  ┌────────────────────┐
//! │ ShardStateService│◀─────────────▶│  ShardStateStore   │
//! └────────┬─────────┘               └────────────────────┘
//!          │ stamps
//!          ▼
//! ┌──────────────────┐  units        ┌────────────────────┐
//! │ ScheduleContext  │──────────────▶│   RollupService    │──▶ MetricStore
//! └──────────────────┘               └────────────────────┘
//! ```
//!
//! # Services
//!
//! - **ServiceManager**: starts services in dependency order, shuts them down
//! - **ShardStateService**: keeps slot state in step with the state store
//! - **RollupService**: schedules eligible slots and rolls them up
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert!(manager.status().is_empty());
//! ```

pub mod framework;
pub mod rollup;
pub mod shard_state;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use rollup::{PassReport, RollupService, RollupServiceConfig, RollupStats, UnitOutcome};
pub use shard_state::{ShardStateService, ShardStateServiceConfig};
