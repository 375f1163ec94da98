//! Storage interfaces and the in-memory reference store

pub mod memory;
pub mod traits;

pub use memory::InMemoryStore;
pub use traits::{read_rollups_as, MetricStore, RollupWrite, ShardStateStore};
