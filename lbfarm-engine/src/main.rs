//! lbfarmd: load-balancer farm reconciliation daemon.
//!
//! Loads declared state from a seed file, wires the farm engine, entity
//! consumers and scheduler together, and runs until interrupted. Farm
//! runtimes are reached over their HTTP control APIs; statuses land back
//! in the repository and the in-process status cache.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lbfarm_core::MemoryStatusCache;
use lbfarm_engine::{
    http_driver_factory, wire, FixCounter, MemoryLocker, MemoryRepository, NullProvisioning,
    Scheduler, SchedulerConfig, Seed,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load-balancer farm reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "lbfarmd", version, about)]
struct Args {
    /// Declared-state seed file (JSON with farms and entities)
    #[arg(long)]
    seed: String,

    /// Sync-enqueue interval in seconds
    #[arg(long, default_value = "10")]
    sync_interval: u64,

    /// Health-check interval in seconds
    #[arg(long, default_value = "60")]
    check_interval: u64,

    /// Diff-report interval in seconds
    #[arg(long, default_value = "60")]
    diff_interval: u64,

    /// Per-request timeout towards farm APIs, in seconds
    #[arg(long, default_value = "10")]
    farm_timeout: u64,

    /// Start with all scheduled jobs paused
    #[arg(long)]
    disable_jobs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lbfarmd=info,lbfarm_engine=info,lbfarm_driver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let seed_raw = std::fs::read_to_string(&args.seed)
        .with_context(|| format!("reading seed file {}", args.seed))?;
    let seed: Seed =
        serde_json::from_str(&seed_raw).with_context(|| format!("parsing seed file {}", args.seed))?;
    info!(
        "loaded {} farm(s) and {} entit(ies) from {}",
        seed.farms.len(),
        seed.entities.len(),
        args.seed
    );

    let repo = Arc::new(MemoryRepository::from_seed(seed));
    let cache = Arc::new(MemoryStatusCache::new());
    let locker = Arc::new(MemoryLocker::new());
    let counter = Arc::new(FixCounter::new());
    let drivers = http_driver_factory(Duration::from_secs(args.farm_timeout));

    let (_engine, farm_queues, _tasks) = wire(
        repo.clone(),
        cache,
        locker,
        counter,
        Arc::new(NullProvisioning),
        drivers.clone(),
    );

    let scheduler = Arc::new(Scheduler::new(
        repo,
        farm_queues,
        drivers,
        SchedulerConfig {
            sync_interval: Duration::from_secs(args.sync_interval),
            check_interval: Duration::from_secs(args.check_interval),
            diff_interval: Duration::from_secs(args.diff_interval),
            disabled: Arc::new(AtomicBool::new(args.disable_jobs)),
        },
    ));
    let _jobs = scheduler.spawn();

    info!("lbfarmd running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
