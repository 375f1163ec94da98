//! Prometheus metrics for the rollup pipeline
//!
//! Everything is registered in the default registry on first use.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::collections::BTreeMap;

use crate::rollup::{Granularity, RollupType};

lazy_static! {
    // === Ingestion ===

    /// Raw samples written through the sample writer
    pub static ref SAMPLES_INGESTED: Counter = register_counter!(
        "rollup_samples_ingested_total",
        "Raw samples written and marked active"
    ).unwrap();

    // === Rollup units ===

    /// Rollup units by outcome
    pub static ref UNITS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_units_total",
        "Rollup units processed",
        &["granularity", "status"]
    ).unwrap();

    /// Failed units by reason
    pub static ref UNIT_FAILURES: CounterVec = register_counter_vec!(
        "rollup_unit_failures_total",
        "Rollup unit failures",
        &["granularity", "reason"]
    ).unwrap();

    /// Rollups written
    pub static ref ROLLUPS_WRITTEN: CounterVec = register_counter_vec!(
        "rollup_rollups_written_total",
        "Rollups written to the metric store",
        &["granularity", "type"]
    ).unwrap();

    /// Unit duration
    pub static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_unit_duration_seconds",
        "Time to roll up one slot across its locators",
        &["granularity"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // === Scheduling state ===

    /// Slots ready but not yet rolled, per granularity
    pub static ref BACKLOG_SLOTS: GaugeVec = register_gauge_vec!(
        "rollup_backlog_slots",
        "Slots waiting to be rolled up",
        &["granularity"]
    ).unwrap();

    /// Slots Active for longer than the stuck threshold
    pub static ref STUCK_SLOTS: Gauge = register_gauge!(
        "rollup_stuck_slots",
        "Slots active past the stuck threshold"
    ).unwrap();

    /// Units currently running
    pub static ref RUNNING_UNITS: Gauge = register_gauge!(
        "rollup_running_units",
        "Rollup units in flight"
    ).unwrap();

    /// Shards managed by this process
    pub static ref MANAGED_SHARDS: Gauge = register_gauge!(
        "rollup_managed_shards",
        "Shards managed by this process"
    ).unwrap();

    // === Shard state ===

    /// Shard state store operations
    pub static ref STATE_OPS: CounterVec = register_counter_vec!(
        "rollup_shard_state_ops_total",
        "Shard state pushes and pulls",
        &["operation", "status"]
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    RUNNING_UNITS.set(0.0);
    STUCK_SLOTS.set(0.0);
    for g in Granularity::rollup_granularities() {
        BACKLOG_SLOTS.with_label_values(&[g.short_name()]).set(0.0);
    }
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a finished unit
#[inline]
pub fn record_unit(granularity: Granularity, status: &str, duration_secs: f64) {
    UNITS_TOTAL
        .with_label_values(&[granularity.short_name(), status])
        .inc();
    UNIT_DURATION
        .with_label_values(&[granularity.short_name()])
        .observe(duration_secs);
}

/// Record why a unit failed
#[inline]
pub fn record_failure(granularity: Granularity, reason: &str) {
    UNIT_FAILURES
        .with_label_values(&[granularity.short_name(), reason])
        .inc();
}

/// Record written rollups
#[inline]
pub fn record_rollups_written(granularity: Granularity, rollup_type: RollupType, count: usize) {
    ROLLUPS_WRITTEN
        .with_label_values(&[granularity.short_name(), rollup_type.name()])
        .inc_by(count as f64);
}

/// Publish the backlog
pub fn update_backlog(backlog: &BTreeMap<Granularity, usize>) {
    for (granularity, slots) in backlog {
        BACKLOG_SLOTS
            .with_label_values(&[granularity.short_name()])
            .set(*slots as f64);
    }
}

/// Publish the stuck slot count
#[inline]
pub fn update_stuck_slots(count: usize) {
    STUCK_SLOTS.set(count as f64);
}

/// Publish the in-flight unit count
#[inline]
pub fn update_running_units(count: usize) {
    RUNNING_UNITS.set(count as f64);
}

/// Publish the managed shard count
#[inline]
pub fn update_managed_shards(count: usize) {
    MANAGED_SHARDS.set(count as f64);
}

/// Record a shard state push or pull
#[inline]
pub fn record_state_op(operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    STATE_OPS.with_label_values(&[operation, status]).inc();
}
