//! Job store: durable queue rows keyed by `job_type`.
//!
//! # Claim protocol
//!
//! `claim_next_runnable` is the only path that moves a row to `running`.
//! It selects the oldest runnable candidate with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never contend on the same row, then stamps the
//! lease (`locked_at`, `heartbeat_at`) and bumps `attempts` in the same
//! statement. A runnable candidate is any of:
//!
//! - `queued`;
//! - `failed` with attempts below the cap and the retry delay elapsed;
//! - `running` with a heartbeat older than `stale_running` (crashed worker).
//!
//! `paused` rows are never candidates; they require an explicit requeue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use uuid::Uuid;

use lxp_schemas::JobStatus;

use crate::cas::{push_assignments, SqlValue};
use crate::tx::Tx;

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub job_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub attempts: i32,
    pub payload: Value,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub parent_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "id, owner_id, job_type, entity_type, entity_id, status, stage, \
     attempts, payload, result, last_error, last_error_at, locked_at, heartbeat_at, \
     parent_job_id, created_at, updated_at";

fn map_job_row(row: &PgRow) -> Result<JobRow> {
    Ok(JobRow {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        job_type: row.try_get("job_type")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        status: JobStatus::parse(&row.try_get::<String, _>("status")?)?,
        stage: row.try_get("stage")?,
        attempts: row.try_get("attempts")?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        last_error: row.try_get("last_error")?,
        last_error_at: row.try_get("last_error_at")?,
        locked_at: row.try_get("locked_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        parent_job_id: row.try_get("parent_job_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub job_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub payload: Value,
    pub parent_job_id: Option<Uuid>,
}

impl NewJob {
    pub fn new(owner_id: Uuid, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            owner_id,
            job_type: job_type.into(),
            entity_type: None,
            entity_id: None,
            payload,
            parent_job_id: None,
        }
    }

    pub fn for_entity(mut self, entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_parent(mut self, parent_job_id: Uuid) -> Self {
        self.parent_job_id = Some(parent_job_id);
        self
    }
}

/// Bulk insert. Rows start `queued` with zero attempts; IDs are generated
/// here and returned in input order.
pub async fn create_jobs(tx: &mut Tx, rows: &[NewJob]) -> Result<Vec<Uuid>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = rows.iter().map(|_| Uuid::new_v4()).collect();

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "insert into job_run (id, owner_id, job_type, entity_type, entity_id, payload, parent_job_id) ",
    );
    qb.push_values(rows.iter().zip(ids.iter()), |mut b, (row, id)| {
        b.push_bind(*id)
            .push_bind(row.owner_id)
            .push_bind(row.job_type.clone())
            .push_bind(row.entity_type.clone())
            .push_bind(row.entity_id)
            .push_bind(row.payload.clone())
            .push_bind(row.parent_job_id);
    });

    qb.build()
        .execute(&mut **tx)
        .await
        .context("create_jobs insert failed")?;

    Ok(ids)
}

/// Enqueue one job, debouncing when an entity scope is given: if an
/// equivalent job is already runnable, nothing is inserted and `None`
/// is returned.
pub async fn enqueue(
    pool: &PgPool,
    owner_id: Uuid,
    job_type: &str,
    entity_type: Option<&str>,
    entity_id: Option<Uuid>,
    payload: Value,
) -> Result<Option<Uuid>> {
    if let (Some(et), Some(eid)) = (entity_type, entity_id) {
        if has_runnable_for_entity(pool, owner_id, et, eid, job_type).await? {
            return Ok(None);
        }
    }

    let mut job = NewJob::new(owner_id, job_type, payload);
    if let (Some(et), Some(eid)) = (entity_type, entity_id) {
        job = job.for_entity(et, eid);
    }

    let ids = crate::in_tx(pool, |tx| {
        Box::pin(async move { create_jobs(tx, &[job]).await })
    })
    .await?;

    Ok(ids.into_iter().next())
}

pub async fn get_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<JobRow>> {
    let rows = sqlx::query(&format!(
        "select {JOB_COLUMNS} from job_run where id = any($1) order by created_at asc"
    ))
    .bind(ids)
    .fetch_all(pool)
    .await
    .context("get_by_ids failed")?;

    rows.iter().map(map_job_row).collect()
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>> {
    let row = sqlx::query(&format!("select {JOB_COLUMNS} from job_run where id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("get_by_id failed")?;

    row.as_ref().map(map_job_row).transpose()
}

/// Latest job for an entity scope, by `created_at` descending.
pub async fn get_latest_by_entity(
    pool: &PgPool,
    owner_id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    job_type: &str,
) -> Result<Option<JobRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {JOB_COLUMNS}
          from job_run
         where owner_id = $1
           and entity_type = $2
           and entity_id = $3
           and job_type = $4
         order by created_at desc
         limit 1
        "#
    ))
    .bind(owner_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(job_type)
    .fetch_optional(pool)
    .await
    .context("get_latest_by_entity failed")?;

    row.as_ref().map(map_job_row).transpose()
}

/// Debounce check: does an equivalent job exist in `queued` or `running`?
pub async fn has_runnable_for_entity(
    pool: &PgPool,
    owner_id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    job_type: &str,
) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
          from job_run
         where owner_id = $1
           and entity_type = $2
           and entity_id = $3
           and job_type = $4
           and status in ('queued', 'running')
        "#,
    )
    .bind(owner_id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(job_type)
    .fetch_one(pool)
    .await
    .context("has_runnable_for_entity failed")?;

    Ok(n > 0)
}

/// Like [`has_runnable_for_entity`] but the entity scope is optional.
pub async fn exists_runnable(
    pool: &PgPool,
    owner_id: Uuid,
    job_type: &str,
    entity_type: Option<&str>,
    entity_id: Option<Uuid>,
) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
          from job_run
         where owner_id = $1
           and job_type = $2
           and ($3::text is null or entity_type = $3)
           and ($4::uuid is null or entity_id = $4)
           and status in ('queued', 'running')
        "#,
    )
    .bind(owner_id)
    .bind(job_type)
    .bind(entity_type)
    .bind(entity_id)
    .fetch_one(pool)
    .await
    .context("exists_runnable failed")?;

    Ok(n > 0)
}

/// Tunables for the claim predicate. Defaults mirror the worker settings.
#[derive(Debug, Clone, Copy)]
pub struct ClaimParams {
    pub max_attempts: i32,
    pub retry_delay: Duration,
    pub stale_running: Duration,
}

/// Claim the oldest runnable job, if any.
///
/// The candidate select and the lease update run as one statement, so the
/// row lock taken by `FOR UPDATE SKIP LOCKED` is released at commit and
/// at most one worker ever owns a given job. Returns `None` (no error)
/// when nothing is runnable.
pub async fn claim_next_runnable(pool: &PgPool, params: ClaimParams) -> Result<Option<JobRow>> {
    let row = sqlx::query(&format!(
        r#"
        with candidate as (
            select id
              from job_run
             where status = 'queued'
                or (status = 'failed'
                    and attempts < $1
                    and (last_error_at is null
                         or last_error_at < now() - ($2 * interval '1 second')))
                or (status = 'running'
                    and heartbeat_at is not null
                    and heartbeat_at < now() - ($3 * interval '1 second'))
             order by created_at asc
             limit 1
             for update skip locked
        )
        update job_run
           set status       = 'running',
               attempts     = attempts + 1,
               locked_at    = now(),
               heartbeat_at = now(),
               updated_at   = now()
         where id in (select id from candidate)
        returning {JOB_COLUMNS}
        "#
    ))
    .bind(params.max_attempts)
    .bind(params.retry_delay.as_secs_f64())
    .bind(params.stale_running.as_secs_f64())
    .fetch_optional(pool)
    .await
    .context("claim_next_runnable failed")?;

    row.as_ref().map(map_job_row).transpose()
}

/// Renew the lease. Silently a no-op unless the job is still `running`.
pub async fn heartbeat(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        update job_run
           set heartbeat_at = now(),
               updated_at   = now()
         where id = $1
           and status = 'running'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .context("heartbeat failed")?;
    Ok(())
}

/// Unconditional field update, used by callers that already enforced
/// their invariants. Always bumps `updated_at`.
pub async fn update_fields(pool: &PgPool, id: Uuid, updates: &[(&str, SqlValue)]) -> Result<()> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("update job_run set ");
    push_assignments(&mut qb, updates);
    qb.push(", updated_at = now() where id = ");
    qb.push_bind(id);

    qb.build()
        .execute(pool)
        .await
        .context("update_fields failed")?;
    Ok(())
}

/// Guarded field update: refuses to touch rows whose status is in the
/// disallowed set. Used by the pause gate so it can never clobber a row
/// that reached a terminal state in the meantime.
pub async fn update_fields_unless_status(
    pool: &PgPool,
    id: Uuid,
    disallowed: &[JobStatus],
    updates: &[(&str, SqlValue)],
) -> Result<bool> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("update job_run set ");
    push_assignments(&mut qb, updates);
    qb.push(", updated_at = now() where id = ");
    qb.push_bind(id);
    qb.push(" and status not in (");
    {
        let mut sep = qb.separated(", ");
        for s in disallowed {
            sep.push_bind(s.as_str());
        }
    }
    qb.push(")");

    let res = qb
        .build()
        .execute(pool)
        .await
        .context("update_fields_unless_status failed")?;

    Ok(res.rows_affected() > 0)
}
