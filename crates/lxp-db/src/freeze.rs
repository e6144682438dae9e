//! Freeze gate persistence.
//!
//! A single sentinel row records whether the platform is frozen. The
//! worker consults it per claim; job types in the configured blocked set
//! are parked as `paused` while the freeze is active. There is no
//! in-process cache — restarts observe whatever the row says.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct FreezeState {
    pub active: bool,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert the sentinel row.
pub async fn set_freeze(pool: &PgPool, active: bool, reason: Option<&str>) -> Result<()> {
    sqlx::query(
        r#"
        insert into sys_freeze_state (sentinel_id, active, reason, updated_at)
        values (1, $1, $2, now())
        on conflict (sentinel_id) do update
            set active     = excluded.active,
                reason     = excluded.reason,
                updated_at = excluded.updated_at
        "#,
    )
    .bind(active)
    .bind(reason)
    .execute(pool)
    .await
    .context("set_freeze failed")?;
    Ok(())
}

/// Load the sentinel. `None` means the row was never written — treat as
/// not frozen.
pub async fn load_freeze(pool: &PgPool) -> Result<Option<FreezeState>> {
    let row: Option<(bool, Option<String>, DateTime<Utc>)> = sqlx::query_as(
        r#"
        select active, reason, updated_at
          from sys_freeze_state
         where sentinel_id = 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .context("load_freeze failed")?;

    Ok(row.map(|(active, reason, updated_at)| FreezeState {
        active,
        reason,
        updated_at,
    }))
}

/// Convenience boolean for the pause gate.
pub async fn freeze_active(pool: &PgPool) -> Result<bool> {
    Ok(load_freeze(pool).await?.map(|f| f.active).unwrap_or(false))
}
