//! Daemon boot sequence: config, database, worker pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use lxp_config::{LoadedConfig, WorkerSettings};
use lxp_worker::{HandlerRegistry, WorkerHandle, WorkerPool};

/// Layered config files, later overrides earlier. Both are optional so an
/// env-only deployment boots with documented defaults.
pub const CONFIG_PATHS: &[&str] = &["config/base.yaml", "config/local.yaml"];

/// A booted daemon: keep the handle to shut the pool down cleanly.
pub struct BootedDaemon {
    pub pool: PgPool,
    pub handle: WorkerHandle,
    pub settings: WorkerSettings,
    pub config_hash: String,
}

/// Load config, connect + migrate the database, and start the worker
/// pool over the supplied registry.
pub async fn boot(registry: Arc<HandlerRegistry>) -> Result<BootedDaemon> {
    let config = load_config()?;
    let settings = config.worker_settings();
    settings.validate();

    tracing::info!(
        config_hash = %config.config_hash,
        concurrency = settings.concurrency,
        max_attempts = settings.max_attempts,
        retry_delay_secs = settings.retry_delay.as_secs(),
        stale_running_secs = settings.stale_running.as_secs(),
        frozen_job_types = ?settings.frozen_job_types,
        "daemon configuration loaded"
    );

    let pool = lxp_db::connect_from_env().await?;
    lxp_db::migrate(&pool).await.context("migrations failed")?;

    let db_status = lxp_db::status(&pool).await.context("db status probe failed")?;
    if db_status.healthy() {
        tracing::info!(
            freeze_active = db_status.freeze_active.unwrap_or(false),
            "database schema ready"
        );
    } else {
        // Migrations just ran, so this indicates a truncated migration
        // set or a wrong search path; refuse to start workers blind.
        anyhow::bail!(
            "core tables missing after migration: {}",
            db_status.missing_tables.join(", ")
        );
    }

    let registered = registry.registered_types();
    if registered.is_empty() {
        tracing::warn!("no handlers registered; claimed jobs will fail at dispatch");
    } else {
        tracing::info!(handlers = ?registered, "handler registry ready");
    }

    let worker_pool = WorkerPool::new(pool.clone(), registry, settings.clone());
    let handle = worker_pool.start();

    Ok(BootedDaemon {
        pool,
        handle,
        settings,
        config_hash: config.config_hash,
    })
}

fn load_config() -> Result<LoadedConfig> {
    lxp_config::load_layered_yaml_existing(CONFIG_PATHS).context("config load failed")
}
