//! Prometheus accounting of the rollup service
//!
//! Kept in its own test binary so no other test touches the global
//! registry while counters are compared.

use kuba_rollup::{
    engine::{memory::FailPoint, InMemoryStore},
    ingestion::SampleWriter,
    metrics,
    rollup::{Granularity, RollupType},
    schedule::ScheduleContext,
    services::{RollupService, RollupServiceConfig},
    types::{Locator, Sample},
};
use std::sync::Arc;
use std::time::Duration;

const MINUTE: i64 = 60_000;
const START: i64 = 1_333_584_000_000;

fn written(granularity: Granularity, rollup_type: RollupType) -> f64 {
    metrics::ROLLUPS_WRITTEN
        .with_label_values(&[granularity.short_name(), rollup_type.name()])
        .get()
}

#[tokio::test]
async fn test_rollups_written_counts_only_successful_writes() {
    metrics::init();
    let store = Arc::new(InMemoryStore::new(1));
    let context = Arc::new(ScheduleContext::new(START, vec![0], Duration::from_secs(300)));
    let writer = SampleWriter::new(store.clone(), context.clone(), 1);
    let service = RollupService::new(RollupServiceConfig::default(), context.clone(), store.clone());

    writer
        .write(&Sample::new(Locator::new("ac1", "svc.latency"), 1i64, START))
        .await
        .unwrap();
    context.set_current_time_millis(START + 20 * MINUTE);
    store.fail_next(FailPoint::WriteRollups, 1);

    let before = written(Granularity::Min5, RollupType::Basic);
    assert_eq!(service.run_pass().await.failed, 1);
    assert_eq!(written(Granularity::Min5, RollupType::Basic), before);

    assert_eq!(service.run_pass().await.completed, 1);
    assert_eq!(written(Granularity::Min5, RollupType::Basic), before + 1.0);
    assert_eq!(written(Granularity::Min5, RollupType::Histogram), 1.0);
}
