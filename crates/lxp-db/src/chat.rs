//! Chat repositories: thread, message, turn.
//!
//! The thread row is the aggregate root — writers lock it before reading
//! or changing anything underneath it. Message `seq` is allocated under
//! that lock and is contiguous per thread.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use lxp_schemas::TurnStatus;

use crate::tx::Tx;

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub version: i32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_thread_row(row: &PgRow) -> Result<ThreadRow> {
    Ok(ThreadRow {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        version: row.try_get("version")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub seq: i32,
    pub role: String,
    pub content: String,
    pub status: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_message_row(row: &PgRow) -> Result<MessageRow> {
    Ok(MessageRow {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        seq: row.try_get("seq")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        status: row.try_get("status")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct TurnRow {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Option<Uuid>,
    pub status: TurnStatus,
    pub job_id: Option<Uuid>,
    pub retrieval_trace: Option<Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_turn_row(row: &PgRow) -> Result<TurnRow> {
    Ok(TurnRow {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        user_message_id: row.try_get("user_message_id")?,
        assistant_message_id: row.try_get("assistant_message_id")?,
        status: TurnStatus::parse(&row.try_get::<String, _>("status")?)?,
        job_id: row.try_get("job_id")?,
        retrieval_trace: row.try_get("retrieval_trace")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_thread(tx: &mut Tx, owner_id: Uuid, title: &str) -> Result<ThreadRow> {
    let row = sqlx::query(
        r#"
        insert into chat_thread (id, owner_id, title)
        values ($1, $2, $3)
        returning id, owner_id, title, version, deleted_at, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner_id)
    .bind(title)
    .fetch_one(&mut **tx)
    .await
    .context("create_thread failed")?;

    map_thread_row(&row)
}

/// Lock the thread row, scoped to its owner. Soft-deleted threads are
/// invisible here.
pub async fn lock_thread_owned(
    tx: &mut Tx,
    thread_id: Uuid,
    owner_id: Uuid,
) -> Result<Option<ThreadRow>> {
    let row = sqlx::query(
        r#"
        select id, owner_id, title, version, deleted_at, created_at, updated_at
          from chat_thread
         where id = $1
           and owner_id = $2
           and deleted_at is null
         for update
        "#,
    )
    .bind(thread_id)
    .bind(owner_id)
    .fetch_optional(&mut **tx)
    .await
    .context("lock_thread_owned failed")?;

    row.as_ref().map(map_thread_row).transpose()
}

/// Next contiguous message sequence for a thread. Callers must hold the
/// thread row lock.
pub async fn next_message_seq(tx: &mut Tx, thread_id: Uuid) -> Result<i32> {
    let (seq,): (i32,) = sqlx::query_as(
        r#"
        select coalesce(max(seq), 0) + 1
          from chat_message
         where thread_id = $1
        "#,
    )
    .bind(thread_id)
    .fetch_one(&mut **tx)
    .await
    .context("next_message_seq failed")?;

    Ok(seq)
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Uuid,
    pub seq: i32,
    pub role: String,
    pub content: String,
    pub status: String,
    pub metadata: Value,
}

pub async fn insert_message(tx: &mut Tx, msg: &NewMessage) -> Result<MessageRow> {
    let row = sqlx::query(
        r#"
        insert into chat_message (id, thread_id, seq, role, content, status, metadata)
        values ($1, $2, $3, $4, $5, $6, $7)
        returning id, thread_id, seq, role, content, status, metadata, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(msg.thread_id)
    .bind(msg.seq)
    .bind(&msg.role)
    .bind(&msg.content)
    .bind(&msg.status)
    .bind(&msg.metadata)
    .fetch_one(&mut **tx)
    .await
    .context("insert_message failed")?;

    map_message_row(&row)
}

pub async fn create_turn(
    tx: &mut Tx,
    thread_id: Uuid,
    user_message_id: Uuid,
    assistant_message_id: Option<Uuid>,
    status: TurnStatus,
) -> Result<TurnRow> {
    let row = sqlx::query(
        r#"
        insert into chat_turn (id, thread_id, user_message_id, assistant_message_id, status)
        values ($1, $2, $3, $4, $5)
        returning id, thread_id, user_message_id, assistant_message_id, status, job_id,
                  retrieval_trace, completed_at, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(thread_id)
    .bind(user_message_id)
    .bind(assistant_message_id)
    .bind(status.as_str())
    .fetch_one(&mut **tx)
    .await
    .context("create_turn failed")?;

    map_turn_row(&row)
}

pub async fn get_turn(tx: &mut Tx, turn_id: Uuid) -> Result<Option<TurnRow>> {
    let row = sqlx::query(
        r#"
        select id, thread_id, user_message_id, assistant_message_id, status, job_id,
               retrieval_trace, completed_at, created_at, updated_at
          from chat_turn
         where id = $1
        "#,
    )
    .bind(turn_id)
    .fetch_optional(&mut **tx)
    .await
    .context("get_turn failed")?;

    row.as_ref().map(map_turn_row).transpose()
}

pub async fn get_turn_by_id(pool: &PgPool, turn_id: Uuid) -> Result<Option<TurnRow>> {
    let row = sqlx::query(
        r#"
        select id, thread_id, user_message_id, assistant_message_id, status, job_id,
               retrieval_trace, completed_at, created_at, updated_at
          from chat_turn
         where id = $1
        "#,
    )
    .bind(turn_id)
    .fetch_optional(pool)
    .await
    .context("get_turn_by_id failed")?;

    row.as_ref().map(map_turn_row).transpose()
}

/// CAS: fail the turn only while it is still queued or running.
/// `rows_affected > 0` means this caller won the race.
pub async fn mark_turn_error_cas(
    tx: &mut Tx,
    turn_id: Uuid,
    trace: &Value,
    job_id: Option<Uuid>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update chat_turn
           set status          = 'error',
               completed_at    = $3,
               retrieval_trace = $2,
               job_id          = coalesce($4, job_id),
               updated_at      = $3
         where id = $1
           and status in ('queued', 'running')
        "#,
    )
    .bind(turn_id)
    .bind(trace)
    .bind(at)
    .bind(job_id)
    .execute(&mut **tx)
    .await
    .context("mark_turn_error_cas failed")?;

    Ok(res.rows_affected() > 0)
}

/// Push the failure onto the assistant message so readers of the thread
/// see the error without joining through the turn.
pub async fn mark_message_error(
    tx: &mut Tx,
    message_id: Uuid,
    metadata: &Value,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update chat_message
           set status     = 'error',
               metadata   = $2,
               updated_at = $3
         where id = $1
        "#,
    )
    .bind(message_id)
    .bind(metadata)
    .bind(at)
    .execute(&mut **tx)
    .await
    .context("mark_message_error failed")?;
    Ok(())
}

/// Messages for a thread in sequence order.
pub async fn list_messages(pool: &PgPool, thread_id: Uuid) -> Result<Vec<MessageRow>> {
    let rows = sqlx::query(
        r#"
        select id, thread_id, seq, role, content, status, metadata, created_at, updated_at
          from chat_message
         where thread_id = $1
         order by seq asc
        "#,
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await
    .context("list_messages failed")?;

    rows.iter().map(map_message_row).collect()
}
