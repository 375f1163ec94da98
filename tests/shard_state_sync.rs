//! Shard state persistence across processes
//!
//! Two schedule contexts stand in for an ingesting process and a rollup
//! process sharing a [`LocalDiskStateStore`] directory.

use kuba_rollup::{
    engine::{InMemoryStore, MetricStore, ShardStateStore},
    ingestion::SampleWriter,
    rollup::Granularity,
    schedule::ScheduleContext,
    services::{
        RollupService, RollupServiceConfig, Service, ServiceConfig, ServiceManager, ShardStateService,
        ShardStateServiceConfig,
    },
    state::SlotState,
    storage::LocalDiskStateStore,
    types::{Locator, Sample},
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const START: i64 = 1_333_584_000_000;
const DELAY: Duration = Duration::from_secs(300);

fn sync_config() -> ShardStateServiceConfig {
    ShardStateServiceConfig {
        push_interval: Duration::from_millis(20),
        pull_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(InMemoryStore::new(1));
    let locator = Locator::new("ac9", "queue.depth");

    // first process ingests and pushes
    {
        let disk: Arc<dyn ShardStateStore> = Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());
        let context = Arc::new(ScheduleContext::new(START, vec![0], DELAY));
        let writer = SampleWriter::new(metrics.clone(), context.clone(), 1);
        let sync = ShardStateService::new(sync_config(), context.clone(), disk);

        writer.write(&Sample::new(locator.clone(), 7i64, START)).await.unwrap();
        assert_eq!(sync.push_all().await, 5);
    }

    // second process loads the state and rolls the slots up
    let disk: Arc<dyn ShardStateStore> = Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());
    let context = Arc::new(ScheduleContext::new(START + HOUR, vec![0], DELAY));
    let sync = ShardStateService::new(sync_config(), context.clone(), disk.clone());
    assert_eq!(sync.pull_all().await, 5);

    let rollups = RollupService::new(RollupServiceConfig::default(), context.clone(), metrics.clone());
    assert_eq!(rollups.run_until_idle(16).await.completed, 5);
    assert_eq!(metrics.rollup_count(Granularity::Min1440), 2);

    // completion is pushed back as Rolled
    assert_eq!(sync.push_all().await, 5);
    let persisted = disk.load_shard_state(0).await.unwrap();
    for granularity in Granularity::ROLLUP {
        let stamp = persisted[&granularity][&granularity.slot(START)];
        assert_eq!(stamp.state(), SlotState::Rolled);
        assert_eq!(stamp.timestamp(), START);
    }
}

#[tokio::test]
async fn test_rolled_state_does_not_hide_newer_remote_write() {
    let dir = TempDir::new().unwrap();
    let disk: Arc<dyn ShardStateStore> = Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());
    let metrics = Arc::new(InMemoryStore::new(1));
    let locator = Locator::new("ac9", "queue.depth");

    let ingest = Arc::new(ScheduleContext::new(START, vec![0], DELAY));
    let ingest_writer = SampleWriter::new(metrics.clone(), ingest.clone(), 1);
    let ingest_sync = ShardStateService::new(sync_config(), ingest.clone(), disk.clone());

    let roller = Arc::new(ScheduleContext::new(START + HOUR, vec![0], DELAY));
    let roller_sync = ShardStateService::new(sync_config(), roller.clone(), disk.clone());
    let rollups = RollupService::new(RollupServiceConfig::default(), roller.clone(), metrics.clone());

    ingest_writer.write(&Sample::new(locator.clone(), 1i64, START)).await.unwrap();
    ingest_sync.push_all().await;
    roller_sync.pull_all().await;
    rollups.run_until_idle(16).await;

    // a late write observed after the rollup, pushed before the roller pushes
    ingest.set_current_time_millis(START + 2 * HOUR);
    ingest_writer
        .write(&Sample::new(locator.clone(), 2i64, START + MINUTE))
        .await
        .unwrap();
    ingest_sync.push_all().await;
    roller_sync.push_all().await;

    let persisted = disk.load_shard_state(0).await.unwrap();
    let stamp = persisted[&Granularity::Min5][&Granularity::Min5.slot(START)];
    assert!(stamp.is_active());
    assert_eq!(stamp.timestamp(), START + 2 * HOUR);

    // the roller picks it up on its next pull
    roller_sync.pull_all().await;
    roller.set_current_time_millis(START + 3 * HOUR);
    assert_eq!(rollups.run_until_idle(16).await.completed, 5);

    let raw = metrics
        .read_raw(&locator, Granularity::Min5.range_for(START))
        .await
        .unwrap();
    assert_eq!(raw.len(), 2);
}

#[tokio::test]
async fn test_pull_before_push_keeps_local_completion() {
    let dir = TempDir::new().unwrap();
    let disk: Arc<dyn ShardStateStore> = Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());
    let metrics = Arc::new(InMemoryStore::new(1));
    let locator = Locator::new("ac9", "queue.depth");

    let context = Arc::new(ScheduleContext::new(START, vec![0], DELAY));
    let writer = SampleWriter::new(metrics.clone(), context.clone(), 1);
    let sync = ShardStateService::new(sync_config(), context.clone(), disk.clone());
    let rollups = RollupService::new(RollupServiceConfig::default(), context.clone(), metrics.clone());

    writer.write(&Sample::new(locator.clone(), 5i64, START)).await.unwrap();
    assert_eq!(sync.push_all().await, 5);

    context.set_current_time_millis(START + HOUR);
    assert_eq!(rollups.run_pass().await.completed, 1);

    // the store still holds Active for the slot that was just rolled
    assert_eq!(sync.pull_all().await, 0);
    let manager = context.shard_state_manager(0).unwrap();
    let five = manager
        .slot_manager(Granularity::Min5)
        .unwrap()
        .get(Granularity::Min5.slot(START))
        .unwrap();
    assert_eq!(five.state(), SlotState::Rolled);
    assert!(five.is_dirty());

    // the 5m slot is not rolled again; its parent is next
    assert_eq!(context.schedule_eligible_slots(), 1);
    assert_eq!(context.next_scheduled().unwrap().key.granularity, Granularity::Min20);

    sync.push_all().await;
    let persisted = disk.load_shard_state(0).await.unwrap();
    assert_eq!(
        persisted[&Granularity::Min5][&Granularity::Min5.slot(START)].state(),
        SlotState::Rolled
    );
}

#[tokio::test]
async fn test_services_run_under_manager() {
    let dir = TempDir::new().unwrap();
    let disk: Arc<dyn ShardStateStore> = Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());
    let metrics = Arc::new(InMemoryStore::new(2));
    let context = Arc::new(ScheduleContext::new(START, vec![0, 1], DELAY));

    let manager = ServiceManager::new(ServiceConfig {
        shutdown_timeout: Duration::from_secs(5),
        startup_wait: Duration::from_secs(2),
    });
    let sync = Arc::new(ShardStateService::new(sync_config(), context.clone(), disk.clone()));
    let rollups = Arc::new(RollupService::new(
        RollupServiceConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        context.clone(),
        metrics.clone(),
    ));
    manager.register(rollups.clone()).unwrap();
    manager.register(sync.clone()).unwrap();

    manager.start_all().await.unwrap();
    assert!(manager.is_healthy());
    assert_eq!(rollups.dependencies(), vec!["shard_state"]);

    let writer = SampleWriter::new(metrics.clone(), context.clone(), 2);
    writer
        .write(&Sample::new(Locator::new("ac1", "disk.free"), 12i64, START))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.shutdown().await.unwrap();
    assert!(sync.status().is_stopped());
    assert!(rollups.status().is_stopped());

    // dirty stamps were flushed to disk by the periodic or final push
    let shard = Locator::new("ac1", "disk.free").shard(2);
    let persisted = disk.load_shard_state(shard).await.unwrap();
    assert_eq!(persisted.len(), 5);
}
