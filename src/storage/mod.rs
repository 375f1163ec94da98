//! Persistent shard state
//!
//! - **LocalDiskStateStore**: one JSON file per shard in a local directory
//!
//! # Example
//!
//! ```rust,no_run
//! use kuba_rollup::storage::LocalDiskStateStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalDiskStateStore::new("/var/lib/rollupd/state")?;
//! assert!(store.base_path().ends_with("state"));
//! # Ok(())
//! # }
//! ```

pub mod local_disk;

pub use local_disk::LocalDiskStateStore;
