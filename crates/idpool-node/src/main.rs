#![doc = include_str!("../README.md")]

mod node;

use clap::Parser;
use core::time::Duration;
use idpool::{AllocationCoordinator, MemoryLockService, MemoryStore};
use node::config::{CliArgs, NodeConfig};
use node::telemetry::init_telemetry;
use tokio::{signal, time::MissedTickBehavior};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type Coordinator = AllocationCoordinator<MemoryStore, MemoryLockService>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = NodeConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let coordinator = Coordinator::new(
        config.coordinator.clone(),
        MemoryStore::new(),
        MemoryLockService::new(),
        idpool::SystemClock,
    );
    coordinator.start().await?;

    for pool in &config.pools {
        coordinator
            .create_pool(&pool.name, pool.low, pool.high)
            .await?;
        #[cfg(feature = "tracing")]
        tracing::info!(pool = %pool.name, low = pool.low, high = pool.high, "Pool ready");
    }

    let result = tokio::select! {
        () = report_stats(&coordinator, config.stats_interval) => Ok(()),
        res = shutdown_signal() => res,
    };

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
    coordinator.shutdown().await;

    #[cfg(feature = "tracing")]
    tracing::info!("Node shut down successfully");
    result
}

fn log_startup_info(_config: &NodeConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting idpool node with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting idpool node {} with {} configured pools",
            _config.coordinator.node_id,
            _config.pools.len()
        );
    }
}

/// Logs this node's cache statistics for every pool it holds, forever.
async fn report_stats(coordinator: &Coordinator, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for pool in coordinator.cached_pools() {
            match coordinator.pool_stats(&pool).await {
                Ok(_stats) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        pool = %pool,
                        range_remaining = _stats.range_remaining,
                        quarantined = _stats.quarantined,
                        quarantine_ready = _stats.quarantine_ready,
                        "Pool stats"
                    );
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(pool = %pool, "Failed to read pool stats: {_e}");
                }
            }
        }

        let _jobs = coordinator.job_stats();
        #[cfg(feature = "tracing")]
        tracing::info!(
            completed = _jobs.completed,
            dropped = _jobs.dropped,
            "Persistence jobs"
        );
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
    Ok(())
}
