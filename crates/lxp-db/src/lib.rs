use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "LXP_DATABASE_URL";
/// Optional pool-size override; defaults to 10 connections.
pub const ENV_DB_MAX_CONNECTIONS: &str = "LXP_DB_MAX_CONNECTIONS";

/// Every table the substrate owns. `status` reports any that are absent
/// so operators see a half-migrated database immediately.
pub const CORE_TABLES: &[&str] = &[
    "job_run",
    "saga_run",
    "saga_action",
    "chat_thread",
    "chat_message",
    "chat_turn",
    "sys_freeze_state",
];

pub mod cas;
pub mod chat;
pub mod freeze;
pub mod jobs;
pub mod sagas;
pub mod tx;

pub use cas::{
    require_cas_success, require_status_allowed, require_version_match, update_by_status,
    update_by_version, SqlValue,
};
pub use jobs::{ClaimParams, JobRow, NewJob};
pub use sagas::{NewSagaAction, SagaActionRow, SagaRow};
pub use tx::{in_tx, Tx};

/// Connect to Postgres using LXP_DATABASE_URL.
///
/// Pool size comes from `LXP_DB_MAX_CONNECTIONS` when set (garbage values
/// fall back to the default). The acquire timeout is deliberately short:
/// a worker that cannot get a connection should fail its claim attempt
/// and retry on the next tick rather than queue up behind a saturated
/// pool.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("{ENV_DB_URL} must point at the platform database"))?;

    let max_connections = std::env::var(ENV_DB_MAX_CONNECTIONS)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|n| *n >= 1)
        .unwrap_or(10);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
        .with_context(|| format!("postgres connection via {ENV_DB_URL} failed"))?;

    Ok(pool)
}

/// Test helper used by integration tests: connect from the env, apply
/// migrations, and refuse to hand out a pool whose schema did not come
/// up whole — a half-migrated test database fails loudly here instead
/// of somewhere inside a scenario.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;

    let st = status(&pool).await?;
    if !st.healthy() {
        anyhow::bail!(
            "test database missing core tables: {}",
            st.missing_tables.join(", ")
        );
    }

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Health probe over this substrate's actual surface: which core tables
/// exist, and whether the freeze sentinel currently reads as active.
/// A successful return already proves connectivity.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let wanted: Vec<String> = CORE_TABLES.iter().map(|t| t.to_string()).collect();

    let present: Vec<String> = sqlx::query_scalar(
        r#"
        select table_name::text
          from information_schema.tables
         where table_schema = 'public'
           and table_name = any($1)
        "#,
    )
    .bind(&wanted)
    .fetch_all(pool)
    .await
    .context("status schema probe failed")?;

    let missing_tables: Vec<String> = CORE_TABLES
        .iter()
        .filter(|t| !present.iter().any(|p| p == *t))
        .map(|t| t.to_string())
        .collect();
    let schema_ready = missing_tables.is_empty();

    // Only consult the sentinel once the schema exists; before migration
    // there is nothing meaningful to read.
    let freeze_active = if schema_ready {
        Some(freeze::freeze_active(pool).await?)
    } else {
        None
    };

    Ok(DbStatus {
        schema_ready,
        missing_tables,
        freeze_active,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub schema_ready: bool,
    /// Core tables absent from the schema; empty when ready.
    pub missing_tables: Vec<String>,
    /// `None` until the schema exists.
    pub freeze_active: Option<bool>,
}

impl DbStatus {
    pub fn healthy(&self) -> bool {
        self.schema_ready
    }
}
