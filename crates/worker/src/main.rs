use std::sync::Arc;

use anyhow::Context;

use jobforge_core::Payload;
use jobforge_infra::QueueConfig;
use jobforge_infra::db::{PoolManager, run_migrations};
use jobforge_infra::jobs::{ExecutionError, JobCoordinator, PgJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = QueueConfig::from_env().context("failed to load configuration")?;

    let pool = Arc::new(PoolManager::new(config.pool.clone()));
    pool.initialize(&config.database_url)
        .await
        .context("failed to initialize connection pool")?;

    let result = run(&config, Arc::clone(&pool)).await;
    pool.close().await;
    result
}

async fn run(config: &QueueConfig, pool: Arc<PoolManager>) -> anyhow::Result<()> {
    if config.run_migrations {
        let handle = pool.ensure_ready().await?;
        run_migrations(&handle, &config.migrations_dir)
            .await
            .context("failed to run migrations")?;
    }

    let mut coordinator = JobCoordinator::new(PgJobStore::new(pool));
    coordinator.register_handler("log", log_job);

    let handle = coordinator.spawn(config.coordinator.clone())?;
    tracing::info!(
        workers = handle.worker_count(),
        poll_interval_ms = config.coordinator.poll_interval.as_millis() as u64,
        "worker running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await?;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        dead_lettered = stats.jobs_dead_lettered,
        unsaved_outcomes = stats.outcome_save_failures,
        "worker stopped"
    );
    Ok(())
}

/// Demonstration handler: logs the payload and succeeds.
async fn log_job(payload: Payload) -> Result<(), ExecutionError> {
    let message = serde_json::Value::Object(payload);
    tracing::info!(payload = %message, "log job");
    Ok(())
}
