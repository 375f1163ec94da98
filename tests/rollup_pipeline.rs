//! End-to-end rollup pipeline tests
//!
//! Samples go in through the [`SampleWriter`], the [`RollupService`] rolls
//! them up through every granularity, and the results are read back from the
//! in-memory store.
//!
//! # Test Coverage
//!
//! 1. **Cascade** - two days of one-minute samples reach the 1440m level
//! 2. **Late data** - a sample landing in a rolled slot is rolled again
//! 3. **Failures** - transient write failures and timeouts are retried
//! 4. **Inconsistent units** - a unit whose children changed is skipped
//! 5. **Backlog** - ready slots are counted per granularity

use kuba_rollup::{
    engine::{memory::FailPoint, read_rollups_as, InMemoryStore, MetricStore},
    ingestion::SampleWriter,
    rollup::{BasicRollup, Granularity, HistogramRollup, Range, Rollup, MAX_BIN_SIZE},
    schedule::{ScheduleContext, SlotKey},
    services::{RollupService, RollupServiceConfig},
    types::{Locator, Points, Sample},
};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
// day-aligned
const START: i64 = 1_333_584_000_000;
const SHARDS: u32 = 4;

struct Pipeline {
    store: Arc<InMemoryStore>,
    context: Arc<ScheduleContext>,
    writer: SampleWriter,
    service: RollupService,
}

fn pipeline(config: RollupServiceConfig) -> Pipeline {
    let store = Arc::new(InMemoryStore::new(SHARDS));
    let context = Arc::new(ScheduleContext::new(START, 0..SHARDS, Duration::from_secs(300)));
    let writer = SampleWriter::new(store.clone(), context.clone(), SHARDS);
    let service = RollupService::new(config, context.clone(), store.clone());
    Pipeline {
        store,
        context,
        writer,
        service,
    }
}

fn cpu() -> Locator {
    Locator::from_path_components("ac1", &["web01", "cpu", "user"])
}

async fn read_basic(p: &Pipeline, granularity: Granularity, range: Range) -> Points<BasicRollup> {
    read_rollups_as::<BasicRollup>(p.store.as_ref(), &cpu(), range, granularity)
        .await
        .expect("read basic rollups")
}

// =============================================================================
// Cascade
// =============================================================================

#[tokio::test]
async fn test_two_day_cascade_reaches_daily_rollups() {
    let p = pipeline(RollupServiceConfig::default());
    let minutes = 2 * 24 * 60;

    for minute in 0..minutes {
        let ts = START + minute * MINUTE;
        p.context.set_current_time_millis(ts);
        let value = (minute % 100) as i64;
        p.writer.write(&Sample::new(cpu(), value, ts)).await.unwrap();
        if minute % 60 == 59 {
            p.service.run_pass().await;
        }
    }

    p.context.set_current_time_millis(START + 2 * DAY + HOUR);
    p.service.run_until_idle(32).await;

    let whole = Range::new(START, START + 2 * DAY);
    assert_eq!(read_basic(&p, Granularity::Min5, whole).await.len(), 576);
    assert_eq!(read_basic(&p, Granularity::Min20, whole).await.len(), 144);
    assert_eq!(read_basic(&p, Granularity::Min60, whole).await.len(), 48);
    assert_eq!(read_basic(&p, Granularity::Min240, whole).await.len(), 12);

    let daily = read_basic(&p, Granularity::Min1440, whole).await;
    assert_eq!(daily.len(), 2);
    for rollup in daily.values() {
        assert_eq!(rollup.count(), 1440);
        assert_eq!(rollup.min(), 0.0);
        assert_eq!(rollup.max(), 99.0);
    }

    let merged = BasicRollup::build_from_rollups(&daily).unwrap();
    assert_eq!(merged.count(), 2880);
    let expected_mean = (0..minutes).map(|m| (m % 100) as f64).sum::<f64>() / minutes as f64;
    assert!((merged.mean() - expected_mean).abs() < 1e-9);

    let histograms = read_rollups_as::<HistogramRollup>(p.store.as_ref(), &cpu(), whole, Granularity::Min1440)
        .await
        .unwrap();
    assert_eq!(histograms.len(), 2);
    for histogram in histograms.values() {
        assert!(!histogram.bins().is_empty());
        assert!(histogram.bins().len() <= MAX_BIN_SIZE);
        assert_eq!(histogram.sample_count(), 1440);
    }

    assert_eq!(p.context.backlog().values().sum::<usize>(), 0);
    assert_eq!(p.context.running_count(), 0);
}

#[tokio::test]
async fn test_locators_on_different_shards_roll_independently() {
    let p = pipeline(RollupServiceConfig::default());
    let locators: Vec<Locator> = (0..20).map(|i| Locator::new("ac1", format!("host{}.load", i))).collect();

    for locator in &locators {
        p.writer.write(&Sample::new(locator.clone(), 1.5, START)).await.unwrap();
    }
    let shards: std::collections::BTreeSet<_> = locators.iter().map(|l| l.shard(SHARDS)).collect();

    p.context.set_current_time_millis(START + HOUR);
    let report = p.service.run_until_idle(16).await;

    assert_eq!(report.completed, shards.len() * 5);
    for granularity in Granularity::ROLLUP {
        // one basic and one histogram per locator
        assert_eq!(p.store.rollup_count(granularity), locators.len() * 2);
    }
}

// =============================================================================
// Late data
// =============================================================================

#[tokio::test]
async fn test_late_sample_rerolls_slot_and_parents() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 10i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    assert_eq!(p.service.run_until_idle(16).await.completed, 5);

    // late sample for the same 5m slot
    p.writer.write(&Sample::new(cpu(), 20i64, START + MINUTE)).await.unwrap();
    let manager = p.context.shard_state_manager(cpu().shard(SHARDS)).unwrap();
    for granularity in Granularity::ROLLUP {
        assert!(manager
            .slot_manager(granularity)
            .unwrap()
            .is_active(granularity.slot(START)));
    }

    // not quiesced yet
    assert_eq!(p.service.run_pass().await.processed(), 0);

    p.context.set_current_time_millis(START + 2 * HOUR);
    assert_eq!(p.service.run_until_idle(16).await.completed, 5);

    let daily = read_basic(&p, Granularity::Min1440, Range::new(START, START + DAY)).await;
    let rollup = daily.values().next().unwrap();
    assert_eq!(rollup.count(), 2);
    assert_eq!(rollup.mean(), 15.0);
}

#[tokio::test]
async fn test_write_during_rollup_keeps_slot_active() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 1i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);

    assert_eq!(p.context.schedule_eligible_slots(), 1);
    let unit = p.context.next_scheduled().unwrap();

    // a newer write lands while the unit is running
    p.context.set_current_time_millis(START + HOUR + MINUTE);
    p.writer.write(&Sample::new(cpu(), 2i64, START + 2 * MINUTE)).await.unwrap();
    p.context.complete(&unit);

    let manager = p.context.shard_state_manager(unit.key.shard).unwrap();
    assert!(manager.slot_manager(Granularity::Min5).unwrap().is_active(unit.key.slot));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 3i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    p.store.fail_next(FailPoint::WriteRollups, 2);

    let first = p.service.run_pass().await;
    assert_eq!(first.failed, 1);
    let second = p.service.run_pass().await;
    assert_eq!(second.failed, 1);
    assert_eq!(p.store.rollup_count(Granularity::Min5), 0);

    let total = p.service.run_until_idle(16).await;
    assert_eq!(total.completed, 5);
    assert_eq!(p.store.rollup_count(Granularity::Min1440), 2);
}

#[tokio::test]
async fn test_failed_finer_read_blocks_coarser_levels() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 3i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    assert_eq!(p.service.run_pass().await.completed, 1);

    p.store.fail_next(FailPoint::ReadRollups, 1);
    assert_eq!(p.service.run_pass().await.failed, 1);
    // 60m cannot run while 20m is still active
    let report = p.service.run_pass().await;
    assert_eq!(report.completed, 1);
    assert_eq!(p.store.rollup_count(Granularity::Min20), 2);
    assert_eq!(p.store.rollup_count(Granularity::Min60), 0);
}

// =============================================================================
// Inconsistent units
// =============================================================================

#[tokio::test]
async fn test_unit_with_reactivated_child_is_skipped() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 3i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    assert_eq!(p.service.run_pass().await.completed, 1);

    // queue the 20m unit, then make one of its 5m children active again
    assert_eq!(p.context.schedule_eligible_slots(), 1);
    p.writer.write(&Sample::new(cpu(), 4i64, START + 6 * MINUTE)).await.unwrap();

    let report = p.service.run_pass().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(p.store.rollup_count(Granularity::Min20), 0);

    let shard = cpu().shard(SHARDS);
    let key = SlotKey::new(shard, Granularity::Min20, Granularity::Min20.slot(START));
    assert!(p.context.verify_ready(&key).is_err());

    p.context.set_current_time_millis(START + 2 * HOUR);
    p.service.run_until_idle(16).await;
    let daily = read_basic(&p, Granularity::Min1440, Range::new(START, START + DAY)).await;
    assert_eq!(daily.values().next().unwrap().count(), 2);
}

#[tokio::test]
async fn test_force_reroll_rewrites_slot() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 8i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    p.service.run_until_idle(16).await;
    let writes_before = p.store.stats().rollup_writes.load(std::sync::atomic::Ordering::Relaxed);

    let shard = cpu().shard(SHARDS);
    assert!(p.context.force_reroll(shard, Granularity::Min1440, Granularity::Min1440.slot(START)));
    assert_eq!(p.service.run_pass().await.completed, 1);

    let writes_after = p.store.stats().rollup_writes.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(writes_after - writes_before, 2);
}

#[tokio::test]
async fn test_force_reroll_carries_repaired_data_to_coarser_levels() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 10i64, START)).await.unwrap();
    p.context.set_current_time_millis(START + HOUR);
    assert_eq!(p.service.run_until_idle(16).await.completed, 5);

    // repaired raw data lands without going through the writer
    p.store
        .write_raw_sample(&Sample::new(cpu(), 30i64, START + MINUTE))
        .await
        .unwrap();
    let shard = cpu().shard(SHARDS);
    assert!(p.context.force_reroll(shard, Granularity::Min5, Granularity::Min5.slot(START)));
    assert_eq!(p.service.run_until_idle(16).await.completed, 5);

    let day = Range::new(START, START + DAY);
    for granularity in Granularity::ROLLUP {
        let rollups = read_basic(&p, granularity, day).await;
        let rollup = rollups.values().next().unwrap();
        assert_eq!(rollup.count(), 2, "{}", granularity);
        assert_eq!(rollup.mean(), 20.0);
    }
}

// =============================================================================
// Backlog
// =============================================================================

#[tokio::test]
async fn test_backlog_drains_level_by_level() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 1i64, START)).await.unwrap();
    p.writer.write(&Sample::new(cpu(), 1i64, START + 30 * MINUTE)).await.unwrap();

    // nothing is ready before the quiescence delay
    assert_eq!(p.context.backlog().values().sum::<usize>(), 0);

    p.context.set_current_time_millis(START + HOUR);
    let backlog = p.context.backlog();
    assert_eq!(backlog[&Granularity::Min5], 2);
    // coarser slots are not ready while their 5m children are active
    assert_eq!(backlog[&Granularity::Min20], 0);
    assert_eq!(backlog[&Granularity::Min60], 0);
    assert_eq!(backlog[&Granularity::Min1440], 0);

    p.service.run_pass().await;
    assert_eq!(p.context.backlog()[&Granularity::Min5], 0);
    assert_eq!(p.context.backlog()[&Granularity::Min20], 2);
    assert_eq!(p.context.backlog()[&Granularity::Min60], 0);

    p.service.run_until_idle(16).await;
    assert!(p.context.backlog().values().all(|n| *n == 0));
}

#[tokio::test]
async fn test_stuck_slots_are_reported() {
    let p = pipeline(RollupServiceConfig::default());
    p.writer.write(&Sample::new(cpu(), 1i64, START)).await.unwrap();
    p.store.fail_next(FailPoint::ReadRaw, usize::MAX / 2);

    p.context.set_current_time_millis(START + 5 * HOUR);
    p.service.run_pass().await;

    let stuck = p.context.stuck_slots(Duration::from_secs(4 * 3600));
    assert_eq!(stuck.len(), 5);
    assert!(stuck.iter().all(|(_, stamp)| stamp.timestamp() == START));
}
