//! Saga repositories: the `saga_run` header and its append-only
//! `saga_action` log.
//!
//! Invariant-bearing writes (append, status transition) go through the
//! saga aggregate, which locks the header row first; the functions here
//! are the table-level primitives it composes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use lxp_schemas::SagaStatus;

use crate::tx::Tx;

#[derive(Debug, Clone)]
pub struct SagaRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub root_job_id: Option<Uuid>,
    pub status: SagaStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_saga_row(row: &PgRow) -> Result<SagaRow> {
    Ok(SagaRow {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        root_job_id: row.try_get("root_job_id")?,
        status: SagaStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct SagaActionRow {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub seq: i32,
    pub kind: String,
    pub payload: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_action_row(row: &PgRow) -> Result<SagaActionRow> {
    Ok(SagaActionRow {
        id: row.try_get("id")?,
        saga_id: row.try_get("saga_id")?,
        seq: row.try_get("seq")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new saga header in status `running`.
pub async fn create_saga(tx: &mut Tx, owner_id: Uuid, root_job_id: Option<Uuid>) -> Result<SagaRow> {
    let row = sqlx::query(
        r#"
        insert into saga_run (id, owner_id, root_job_id, status)
        values ($1, $2, $3, 'running')
        returning id, owner_id, root_job_id, status, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner_id)
    .bind(root_job_id)
    .fetch_one(&mut **tx)
    .await
    .context("create_saga failed")?;

    map_saga_row(&row)
}

/// Lock the saga header for the rest of the transaction.
/// Concurrent appenders and transition callers serialize here.
pub async fn lock_saga(tx: &mut Tx, id: Uuid) -> Result<Option<SagaRow>> {
    let row = sqlx::query(
        r#"
        select id, owner_id, root_job_id, status, created_at, updated_at
          from saga_run
         where id = $1
         for update
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .context("lock_saga failed")?;

    row.as_ref().map(map_saga_row).transpose()
}

/// Next contiguous sequence number for this saga.
pub async fn next_action_seq(tx: &mut Tx, saga_id: Uuid) -> Result<i32> {
    let (seq,): (i32,) = sqlx::query_as(
        r#"
        select coalesce(max(seq), 0) + 1
          from saga_action
         where saga_id = $1
        "#,
    )
    .bind(saga_id)
    .fetch_one(&mut **tx)
    .await
    .context("next_action_seq failed")?;

    Ok(seq)
}

#[derive(Debug, Clone)]
pub struct NewSagaAction {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub seq: i32,
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

pub async fn insert_action(tx: &mut Tx, action: &NewSagaAction) -> Result<SagaActionRow> {
    let row = sqlx::query(
        r#"
        insert into saga_action (id, saga_id, seq, kind, payload, status, created_at, updated_at)
        values ($1, $2, $3, $4, $5, 'pending', $6, $6)
        returning id, saga_id, seq, kind, payload, status, created_at, updated_at
        "#,
    )
    .bind(action.id)
    .bind(action.saga_id)
    .bind(action.seq)
    .bind(&action.kind)
    .bind(&action.payload)
    .bind(action.at)
    .fetch_one(&mut **tx)
    .await
    .context("insert_action failed")?;

    map_action_row(&row)
}

pub async fn set_saga_status(
    tx: &mut Tx,
    id: Uuid,
    to: SagaStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update saga_run
           set status = $2,
               updated_at = $3
         where id = $1
        "#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(at)
    .execute(&mut **tx)
    .await
    .context("set_saga_status failed")?;
    Ok(())
}

pub async fn get_saga(pool: &PgPool, id: Uuid) -> Result<Option<SagaRow>> {
    let row = sqlx::query(
        r#"
        select id, owner_id, root_job_id, status, created_at, updated_at
          from saga_run
         where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_saga failed")?;

    row.as_ref().map(map_saga_row).transpose()
}

/// Actions for a saga, newest first.
pub async fn list_actions_desc(pool: &PgPool, saga_id: Uuid) -> Result<Vec<SagaActionRow>> {
    let rows = sqlx::query(
        r#"
        select id, saga_id, seq, kind, payload, status, created_at, updated_at
          from saga_action
         where saga_id = $1
         order by seq desc
        "#,
    )
    .bind(saga_id)
    .fetch_all(pool)
    .await
    .context("list_actions_desc failed")?;

    rows.iter().map(map_action_row).collect()
}

/// Settle one action. Returns false when the action does not exist or was
/// already settled out of `pending`.
pub async fn set_action_status(pool: &PgPool, action_id: Uuid, status: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update saga_action
           set status = $2,
               updated_at = now()
         where id = $1
           and status = 'pending'
        "#,
    )
    .bind(action_id)
    .bind(status)
    .execute(pool)
    .await
    .context("set_action_status failed")?;

    Ok(res.rows_affected() > 0)
}

/// Count of actions still `pending` — zero means compensation can close.
pub async fn count_pending_actions(pool: &PgPool, saga_id: Uuid) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
          from saga_action
         where saga_id = $1
           and status = 'pending'
        "#,
    )
    .bind(saga_id)
    .fetch_one(pool)
    .await
    .context("count_pending_actions failed")?;

    Ok(n)
}
