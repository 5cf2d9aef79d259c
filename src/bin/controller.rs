//! # Tasker Queue Controller
//!
//! Long-running controller process: loads configuration, connects to
//! PostgreSQL, applies migrations, then runs the partition heartbeat, the
//! retention sweep and the timeout reaper until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tasker_queue::config::ConfigManager;
use tasker_queue::database::{run_migrations, DatabaseConnection};
use tasker_queue::logging::init_structured_logging;
use tasker_queue::orchestration::{
    spawn_partition_heartbeat, spawn_retention_controller, spawn_timeout_reaper,
    ConcurrencyController, RetentionController, StepRunQueue, TenantPartitionManager,
    TimeoutReaper, WorkflowEngine, WorkflowRegistry,
};
use tasker_queue::repository::PgRepository;
use tasker_queue::utils::SystemClock;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tasker-queue-controller")]
#[command(about = "Run partition heartbeats, retention and timeout sweeps")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Environment overriding TASKER_ENV / APP_ENV
    #[arg(short, long)]
    environment: Option<String>,

    /// Partition id overriding the configured one
    #[arg(short, long)]
    partition_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.environment {
        Some(environment) => ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment),
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    }
    .context("failed to load configuration")?;
    let mut config = manager.config().clone();
    if let Some(partition_id) = cli.partition_id {
        config.partition.partition_id = Some(partition_id);
    }

    init_structured_logging(&config.logging);
    info!(environment = %manager.environment(), "🚀 Starting tasker queue controller");

    let database = DatabaseConnection::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    if config.database.run_migrations {
        run_migrations(database.pool())
            .await
            .context("failed to run migrations")?;
    }

    let repository = Arc::new(PgRepository::new(database.pool().clone()));
    let clock = Arc::new(SystemClock);

    let queue = Arc::new(
        StepRunQueue::new(
            repository.clone(),
            ConcurrencyController::new(repository.clone()),
            clock.clone(),
        )
        .with_config(config.queue.clone())
        .with_retention_period(config.retention.retention_period()),
    );
    let partitions = TenantPartitionManager::from_config(&config.partition, repository.clone(), clock);
    let engine = Arc::new(WorkflowEngine::new(
        Arc::new(WorkflowRegistry::new()),
        queue.clone(),
        repository,
    ));

    let mut tasks = Vec::new();
    tasks.push(spawn_partition_heartbeat(
        partitions.clone(),
        config.partition.heartbeat_interval(),
    ));
    if config.retention.enabled {
        let retention = RetentionController::new(partitions.clone(), queue)
            .with_sweep_budget(config.retention.sweep_budget())
            .with_backoff(config.backoff.clone());
        tasks.push(spawn_retention_controller(retention, config.retention.interval()));
    } else {
        warn!("Retention sweep disabled by configuration");
    }
    tasks.push(spawn_timeout_reaper(
        TimeoutReaper::new(partitions.clone(), engine),
        config.queue.timeout_check_interval(),
    ));

    info!(partition_id = %partitions.partition_id(), "✅ Controller running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 Shutdown requested");

    for (_, shutdown) in &tasks {
        // a task that already exited has dropped its receiver
        let _ = shutdown.send(true);
    }
    for (handle, _) in tasks {
        if let Err(err) = handle.await {
            warn!(error = %err, "Background task ended abnormally");
        }
    }

    database.close().await;
    info!("👋 Controller stopped");
    Ok(())
}
