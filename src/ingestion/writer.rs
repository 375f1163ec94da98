//! Raw sample writer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::traits::MetricStore;
use crate::error::Result;
use crate::metrics;
use crate::schedule::ScheduleContext;
use crate::types::{Sample, ShardId};

/// Writer counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    /// Samples written
    pub samples_written: u64,
    /// Samples whose write failed
    pub write_errors: u64,
}

/// Writes raw samples and notifies the schedule context
pub struct SampleWriter {
    store: Arc<dyn MetricStore>,
    context: Arc<ScheduleContext>,
    shard_count: u32,
    samples_written: AtomicU64,
    write_errors: AtomicU64,
}

impl SampleWriter {
    /// Create a writer spreading locators over `shard_count` shards
    pub fn new(store: Arc<dyn MetricStore>, context: Arc<ScheduleContext>, shard_count: u32) -> Self {
        Self {
            store,
            context,
            shard_count,
            samples_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Shard of a sample's locator
    pub fn shard_of(&self, sample: &Sample) -> ShardId {
        sample.locator.shard(self.shard_count)
    }

    /// Persist one sample, then mark its slots Active
    ///
    /// The slots are only marked once the write succeeded, so a rollup never
    /// runs for data that is not readable yet.
    pub async fn write(&self, sample: &Sample) -> Result<ShardId> {
        let shard = self.shard_of(sample);
        if let Err(e) = self.store.write_raw_sample(sample).await {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(locator = %sample.locator, shard, error = %e, "Raw sample write failed");
            return Err(e.into());
        }

        self.context.update(sample.timestamp_ms, shard);
        self.samples_written.fetch_add(1, Ordering::Relaxed);
        metrics::SAMPLES_INGESTED.inc();
        debug!(locator = %sample.locator, shard, ts = sample.timestamp_ms, "Sample written");
        Ok(shard)
    }

    /// Write samples in order, stopping at the first failure
    pub async fn write_batch(&self, samples: &[Sample]) -> Result<usize> {
        for sample in samples {
            self.write(sample).await?;
        }
        Ok(samples.len())
    }

    /// Counters so far
    pub fn stats(&self) -> WriteStats {
        WriteStats {
            samples_written: self.samples_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
