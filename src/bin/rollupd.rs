//! Rollup daemon
//!
//! # CLI Commands
//!
//! - `start` - Run the rollup and shard state services (default)
//! - `check-config` - Validate the configuration file
//! - `simulate` - Feed synthetic samples through an in-memory store and
//!   report what was rolled up
//!
//! # Configuration
//!
//! The daemon reads configuration from:
//! 1. `--config` / `ROLLUP_CONFIG` (path to TOML file)
//! 2. `./rollup.toml` in current directory
//! 3. Default configuration
//!
//! `ROLLUP_*` environment variables override file values.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};

use kuba_rollup::{
    config::{Config, StateBackend},
    engine::{InMemoryStore, ShardStateStore},
    ingestion::SampleWriter,
    metrics,
    rollup::Granularity,
    schedule::ScheduleContext,
    services::{
        RollupService, RollupServiceConfig, ServiceConfig, ServiceManager, ShardStateService,
        ShardStateServiceConfig,
    },
    storage::LocalDiskStateStore,
    types::{Locator, Sample},
};

const DEFAULT_CONFIG_FILE: &str = "rollup.toml";

// =============================================================================
// CLI Definition
// =============================================================================

/// Rollup daemon for a sharded time-series store
#[derive(Parser)]
#[command(name = "rollupd")]
#[command(version)]
#[command(about = "Rolls raw samples up into coarser granularities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "ROLLUP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the services until interrupted (default)
    Start,

    /// Validate configuration file without starting the services
    CheckConfig,

    /// Roll up synthetic data in memory and print a summary
    Simulate {
        /// Hours of one-minute samples to generate
        #[arg(long, default_value_t = 48)]
        hours: u32,

        /// Number of series
        #[arg(long, default_value_t = 10)]
        locators: usize,

        /// Print gathered Prometheus metrics at the end
        #[arg(long)]
        print_metrics: bool,
    },
}

// =============================================================================
// Configuration and logging
// =============================================================================

fn load_config(cli: &Cli) -> kuba_rollup::Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()));

    let config = match path {
        Some(path) => Config::from_file_with_env(&path.to_string_lossy())?,
        None => Config::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitoring.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn state_store(config: &Config, fallback: Arc<InMemoryStore>) -> kuba_rollup::Result<Arc<dyn ShardStateStore>> {
    match config.state.backend {
        StateBackend::Memory => Ok(fallback),
        StateBackend::LocalDisk => Ok(Arc::new(LocalDiskStateStore::new(&config.state.data_dir)?)),
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(config: &Config) {
    let shards = config.schedule.resolved_shards();

    println!("Configuration is valid!");
    println!();
    println!("Schedule:");
    println!("  Shard count: {}", config.schedule.shard_count);
    println!("  Managed shards: {}", shards.len());
    println!("  Quiescence delay: {:?}", config.schedule.quiescence_delay());
    println!("  Poll interval: {:?}", config.schedule.poll_interval());
    println!();
    println!("Rollup:");
    println!("  Max concurrency: {}", config.rollup.max_concurrency);
    println!("  Unit timeout: {:?}", config.rollup.unit_timeout());
    let types: Vec<&str> = config.rollup.rollup_types.iter().map(|t| t.name()).collect();
    println!("  Rollup types: {}", types.join(", "));
    println!();
    println!("State:");
    println!("  Backend: {:?}", config.state.backend);
    if config.state.backend == StateBackend::LocalDisk {
        println!("  Data directory: {:?}", config.state.data_dir);
    }
    println!();
    println!("Monitoring:");
    println!("  Metrics enabled: {}", config.monitoring.metrics_enabled);
    println!("  Log level: {}", config.monitoring.log_level);
}

async fn cmd_start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.monitoring.metrics_enabled {
        metrics::init();
    }

    let now = chrono::Utc::now().timestamp_millis();
    let context = Arc::new(ScheduleContext::new(
        now,
        config.schedule.resolved_shards(),
        config.schedule.quiescence_delay(),
    ));
    let metric_store = Arc::new(InMemoryStore::new(config.schedule.shard_count));
    let state_store = state_store(&config, metric_store.clone())?;

    let manager = ServiceManager::new(ServiceConfig::default());
    manager.register(Arc::new(ShardStateService::new(
        ShardStateServiceConfig::from(&config),
        context.clone(),
        state_store,
    )))?;
    manager.register(Arc::new(RollupService::new(
        RollupServiceConfig::from(&config),
        context,
        metric_store,
    )))?;

    manager.start_all().await?;
    info!("Rollup daemon v{} started", env!("CARGO_PKG_VERSION"));

    shutdown_signal().await;
    manager.shutdown().await?;
    info!("Rollup daemon stopped");
    Ok(())
}

async fn cmd_simulate(
    config: Config,
    hours: u32,
    locator_count: usize,
    print_metrics: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    const MINUTE: i64 = 60_000;
    let shard_count = config.schedule.shard_count;
    let start = Granularity::Min1440.snap_millis(chrono::Utc::now().timestamp_millis()) - 7 * 24 * 60 * MINUTE;

    let store = Arc::new(InMemoryStore::new(shard_count));
    let context = Arc::new(ScheduleContext::new(
        start,
        config.schedule.resolved_shards(),
        config.schedule.quiescence_delay(),
    ));
    let writer = SampleWriter::new(store.clone(), context.clone(), shard_count);
    let service = RollupService::new(RollupServiceConfig::from(&config), context.clone(), store.clone());

    let locators: Vec<Locator> = (0..locator_count)
        .map(|i| Locator::from_path_components("sim", &["host", &format!("h{:03}", i), "cpu"]))
        .collect();
    let mut rng = rand::thread_rng();

    let minutes = i64::from(hours) * 60;
    for minute in 0..minutes {
        let ts = start + minute * MINUTE;
        context.set_current_time_millis(ts);
        for locator in &locators {
            let value: f64 = rng.gen_range(0.0..100.0);
            writer.write(&Sample::new(locator.clone(), value, ts)).await?;
        }
        if minute % 5 == 4 {
            service.run_pass().await;
        }
    }

    // let every slot quiesce, then drain
    context.set_current_time_millis(start + minutes * MINUTE + Granularity::Min1440.milliseconds());
    service.run_until_idle(64).await;

    let stats = service.stats();
    println!("Simulated {} hours for {} locators", hours, locator_count);
    println!("  Samples written: {}", writer.stats().samples_written);
    println!("  Passes: {}", stats.passes);
    println!("  Units completed: {}", stats.units_completed);
    println!("  Units failed: {}", stats.units_failed);
    println!("  Units skipped: {}", stats.units_skipped);
    println!();
    println!("Rollups per granularity (backlog):");
    let backlog = context.backlog();
    for granularity in Granularity::ROLLUP {
        println!(
            "  {:>8}: {} ({})",
            granularity.name(),
            store.rollup_count(granularity),
            backlog.get(&granularity).copied().unwrap_or_default()
        );
    }
    let remaining: usize = backlog.values().sum();
    if remaining > 0 {
        warn!(remaining, "Slots left active after simulation");
    }

    if print_metrics {
        println!();
        print!("{}", metrics::gather_metrics()?);
    }
    Ok(())
}

/// Graceful shutdown signal handler
///
/// A failed handler installation is logged and that signal is ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping services");
}

fn config_label(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            println!("Loaded {}", config_label(cli.config.as_deref()));
            cmd_check_config(&config);
            Ok(())
        },
        Some(Commands::Simulate {
            hours,
            locators,
            print_metrics,
        }) => {
            init_tracing(&config);
            cmd_simulate(config, hours, locators, print_metrics).await
        },
        Some(Commands::Start) | None => {
            init_tracing(&config);
            cmd_start(config).await
        },
    }
}
