//! Rollup Service
//!
//! Drives the schedule context: every poll it queues the slots that became
//! eligible, rolls them up on a bounded set of tasks and records the outcome.
//!
//! - 5m slots are built from raw samples
//! - coarser slots are built from rollups of the next finer granularity
//! - a unit that fails or times out leaves its slot Active for a later pass

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::traits::{read_rollups_as, MetricStore, RollupWrite};
use crate::error::{Error, Result, StorageError};
use crate::metrics;
use crate::rollup::{BasicRollup, Granularity, HistogramRollup, Rollup, RollupType};
use crate::schedule::{ScheduleContext, ScheduledUnit};
use crate::types::Locator;

use super::framework::{Service, ServiceError, ServiceStatus};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the rollup service
#[derive(Debug, Clone)]
pub struct RollupServiceConfig {
    /// Interval between scheduling passes
    pub poll_interval: Duration,
    /// Units rolled up concurrently
    pub max_concurrency: usize,
    /// Timeout of one unit
    pub unit_timeout: Duration,
    /// Rollup kinds computed for every slot
    pub rollup_types: Vec<RollupType>,
    /// Requeue transiently failed units at the front of the queue
    pub immediate_retry: bool,
    /// Age after which an Active slot is reported as stuck
    pub stuck_threshold: Duration,
}

impl Default for RollupServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrency: 4,
            unit_timeout: Duration::from_secs(60),
            rollup_types: RollupType::ALL.to_vec(),
            immediate_retry: false,
            stuck_threshold: Duration::from_secs(4 * 3600),
        }
    }
}

impl From<&Config> for RollupServiceConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.schedule.poll_interval(),
            max_concurrency: config.rollup.max_concurrency,
            unit_timeout: config.rollup.unit_timeout(),
            rollup_types: config.rollup.rollup_types.clone(),
            immediate_retry: config.rollup.immediate_retry,
            stuck_threshold: config.schedule.stuck_threshold(),
        }
    }
}

// ============================================================================
// Outcomes and statistics
// ============================================================================

/// What happened to one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Rolled up; carries the number of rollups written
    Completed(usize),
    /// Read, build or write failed; slot stays Active
    Failed,
    /// Exceeded the unit timeout; slot stays Active
    TimedOut,
    /// State changed since scheduling; slot stays Active
    Skipped,
}

impl UnitOutcome {
    fn status(self) -> &'static str {
        match self {
            UnitOutcome::Completed(_) => "completed",
            UnitOutcome::Failed => "failed",
            UnitOutcome::TimedOut => "timed_out",
            UnitOutcome::Skipped => "skipped",
        }
    }
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Slots newly queued by this pass
    pub scheduled: usize,
    /// Units rolled up
    pub completed: usize,
    /// Units that failed or timed out
    pub failed: usize,
    /// Units skipped because their state changed
    pub skipped: usize,
    /// Rollups written
    pub rollups_written: usize,
}

impl PassReport {
    /// Units processed in the pass
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Completed(written) => {
                self.completed += 1;
                self.rollups_written += written;
            },
            UnitOutcome::Failed | UnitOutcome::TimedOut => self.failed += 1,
            UnitOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Totals across passes
#[derive(Debug, Clone, Default)]
pub struct RollupStats {
    /// Passes run
    pub passes: u64,
    /// Units rolled up
    pub units_completed: u64,
    /// Units that failed or timed out
    pub units_failed: u64,
    /// Units skipped
    pub units_skipped: u64,
    /// Rollups written
    pub rollups_written: u64,
}

// ============================================================================
// Rollup Service
// ============================================================================

/// Background service rolling up eligible slots
pub struct RollupService {
    config: RollupServiceConfig,
    context: Arc<ScheduleContext>,
    store: Arc<dyn MetricStore>,
    permits: Arc<Semaphore>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<RollupStats>,
}

impl RollupService {
    /// Create the service
    pub fn new(
        config: RollupServiceConfig,
        context: Arc<ScheduleContext>,
        store: Arc<dyn MetricStore>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            context,
            store,
            permits,
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(RollupStats::default()),
        }
    }

    /// Schedule context driven by this service
    pub fn context(&self) -> &Arc<ScheduleContext> {
        &self.context
    }

    /// Totals so far
    pub fn stats(&self) -> RollupStats {
        self.stats.read().clone()
    }

    /// Run one scheduling pass
    ///
    /// Queues newly eligible slots, then processes the units queued at the
    /// start of the processing step. Units made eligible by this pass's
    /// completions are picked up by the next one.
    pub async fn run_pass(&self) -> PassReport {
        let mut report = PassReport {
            scheduled: self.context.schedule_eligible_slots(),
            ..Default::default()
        };

        let budget = self.context.scheduled_count();
        let mut tasks = JoinSet::new();

        for _ in 0..budget {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(unit) = self.context.next_scheduled() else {
                break;
            };
            metrics::update_running_units(self.context.running_count());

            let context = Arc::clone(&self.context);
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            tasks.spawn(async move {
                let running = RunningUnit::new(Arc::clone(&context), unit.clone());
                let outcome = process_unit(&context, store.as_ref(), &config, &unit).await;
                running.finished();
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    // the unit was released when its task unwound
                    error!(error = %e, "Rollup task panicked");
                    report.failed += 1;
                },
            }
        }
        metrics::update_running_units(self.context.running_count());

        self.publish_state();
        self.record_pass(&report);
        report
    }

    /// Run passes until nothing is left to do or `max_passes` is reached
    pub async fn run_until_idle(&self, max_passes: usize) -> PassReport {
        let mut total = PassReport::default();
        for _ in 0..max_passes {
            let report = self.run_pass().await;
            if report.scheduled == 0 && report.processed() == 0 {
                break;
            }
            total.scheduled += report.scheduled;
            total.completed += report.completed;
            total.failed += report.failed;
            total.skipped += report.skipped;
            total.rollups_written += report.rollups_written;
        }
        total
    }

    fn publish_state(&self) {
        metrics::update_backlog(&self.context.backlog());
        metrics::update_managed_shards(self.context.managed_shards().len());
        let stuck = self.context.stuck_slots(self.config.stuck_threshold);
        metrics::update_stuck_slots(stuck.len());
        for (key, stamp) in stuck.iter().take(10) {
            debug!(slot_key = %key, stamp_ts = stamp.timestamp(), "Slot stuck in active state");
        }
    }

    fn record_pass(&self, report: &PassReport) {
        let mut stats = self.stats.write();
        stats.passes += 1;
        stats.units_completed += report.completed as u64;
        stats.units_failed += report.failed as u64;
        stats.units_skipped += report.skipped as u64;
        stats.rollups_written += report.rollups_written as u64;

        if report.processed() > 0 {
            debug!(
                scheduled = report.scheduled,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                written = report.rollups_written,
                "Rollup pass finished"
            );
        }
    }
}

// ============================================================================
// Unit execution
// ============================================================================

/// Releases a unit whose task ends without an outcome
///
/// A panicking or cancelled task would otherwise leave the unit in the
/// running set, blocking its slot and every coarser slot above it.
struct RunningUnit {
    context: Arc<ScheduleContext>,
    unit: Option<ScheduledUnit>,
}

impl RunningUnit {
    fn new(context: Arc<ScheduleContext>, unit: ScheduledUnit) -> Self {
        Self {
            context,
            unit: Some(unit),
        }
    }

    /// The unit was completed or failed through the normal path
    fn finished(mut self) {
        self.unit = None;
    }
}

impl Drop for RunningUnit {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            warn!(slot_key = %unit.key, "Rollup task ended without an outcome, releasing unit");
            metrics::record_failure(unit.key.granularity, "panic");
            self.context.fail(&unit, false);
        }
    }
}

async fn process_unit(
    context: &ScheduleContext,
    store: &dyn MetricStore,
    config: &RollupServiceConfig,
    unit: &ScheduledUnit,
) -> UnitOutcome {
    let started = Instant::now();
    let granularity = unit.key.granularity;

    let outcome = if let Err(e) = context.verify_ready(&unit.key) {
        warn!(slot_key = %unit.key, error = %e, "Skipping unit");
        metrics::record_failure(granularity, "inconsistent");
        context.fail(unit, false);
        UnitOutcome::Skipped
    } else {
        match tokio::time::timeout(config.unit_timeout, roll_unit(store, unit, &config.rollup_types)).await {
            Ok(Ok(written)) => {
                context.complete(unit);
                UnitOutcome::Completed(written)
            },
            Ok(Err(e)) => {
                let transient = e.is_transient();
                warn!(slot_key = %unit.key, error = %e, transient, "Rollup unit failed");
                metrics::record_failure(granularity, failure_reason(&e));
                context.fail(unit, config.immediate_retry && transient);
                UnitOutcome::Failed
            },
            Err(_) => {
                let e = StorageError::Timeout {
                    operation: "rollup_unit",
                    timeout_ms: config.unit_timeout.as_millis() as u64,
                };
                warn!(slot_key = %unit.key, error = %e, "Rollup unit timed out");
                metrics::record_failure(granularity, "timeout");
                context.fail(unit, config.immediate_retry);
                UnitOutcome::TimedOut
            },
        }
    };

    metrics::record_unit(granularity, outcome.status(), started.elapsed().as_secs_f64());
    outcome
}

fn failure_reason(e: &Error) -> &'static str {
    match e {
        Error::Storage(StorageError::Timeout { .. }) => "timeout",
        Error::Storage(_) | Error::Io(_) => "storage",
        Error::Rollup(_) => "build",
        _ => "other",
    }
}

/// Build and write every rollup of one slot; returns the number written
async fn roll_unit(store: &dyn MetricStore, unit: &ScheduledUnit, types: &[RollupType]) -> Result<usize> {
    let locators = store.locators_for_shard(unit.key.shard).await?;
    let mut writes = Vec::new();

    for locator in &locators {
        for rollup_type in types {
            let write = match rollup_type {
                RollupType::Basic => build_rollup::<BasicRollup>(store, locator, unit).await?,
                RollupType::Histogram => build_rollup::<HistogramRollup>(store, locator, unit).await?,
            };
            writes.extend(write);
        }
    }

    let written = writes.len();
    if written > 0 {
        let counts: Vec<(RollupType, usize)> = types
            .iter()
            .map(|t| (*t, writes.iter().filter(|w| w.rollup_type() == *t).count()))
            .collect();
        store.write_rollups(writes).await?;
        for (rollup_type, count) in counts {
            metrics::record_rollups_written(unit.key.granularity, rollup_type, count);
        }
    }

    debug!(
        slot_key = %unit.key,
        range = %unit.range,
        locators = locators.len(),
        written,
        "Unit rolled up"
    );
    Ok(written)
}

/// Rollup of one locator for the unit's slot; `None` when there is no data
async fn build_rollup<R: Rollup>(
    store: &dyn MetricStore,
    locator: &Locator,
    unit: &ScheduledUnit,
) -> Result<Option<RollupWrite>> {
    let granularity = unit.key.granularity;
    let rollup = match granularity.finer() {
        Some(Granularity::Full) | None => {
            let raw = store.read_raw(locator, unit.range).await?;
            if raw.is_empty() {
                return Ok(None);
            }
            R::build_from_raw_samples(&raw)?
        },
        Some(finer) => {
            let points = read_rollups_as::<R>(store, locator, unit.range, finer).await?;
            if points.is_empty() {
                return Ok(None);
            }
            R::build_from_rollups(&points)?
        },
    };
    Ok(Some(RollupWrite::new(locator.clone(), granularity, unit.range.start, rollup)))
}

#[async_trait::async_trait]
impl Service for RollupService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        info!(
            shards = self.context.managed_shards().len(),
            max_concurrency = self.config.max_concurrency,
            "Rollup service started"
        );

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Rollup service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Rollup service broadcast receiver lagged");
                        }
                    }
                }

                _ = poll.tick() => {
                    self.context.set_current_time_millis(chrono::Utc::now().timestamp_millis());
                    self.run_pass().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        info!("Rollup service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rollup"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["shard_state"]
    }
}
