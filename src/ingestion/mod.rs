//! Ingestion notification path
//!
//! Writes raw samples to the metric store and marks the slots they land in
//! Active, so the scheduler knows they need rolling up.

pub mod writer;

pub use writer::{SampleWriter, WriteStats};
