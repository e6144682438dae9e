//! Compare-and-set helpers for optimistic concurrency.
//!
//! Both primitives emit a single `UPDATE` whose `WHERE` clause asserts the
//! expected prior state; `rows_affected > 0` is the success signal. Table
//! and column names come from application code, never from user input —
//! only values are bound.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use lxp_errors::{Code, CoreError, CoreResult};

use crate::tx::Tx;

/// A bindable value for dynamically-built updates.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    I64(i64),
    I32(i32),
    Bool(bool),
    /// Emitted as a SQL `NULL` literal so the column's own type applies.
    Null,
}

pub(crate) fn push_assignments(
    qb: &mut QueryBuilder<'_, Postgres>,
    updates: &[(&str, SqlValue)],
) {
    let mut sep = qb.separated(", ");
    for (col, val) in updates {
        sep.push(format!("{col} = "));
        match val {
            SqlValue::Text(v) => sep.push_bind_unseparated(v.clone()),
            SqlValue::Uuid(v) => sep.push_bind_unseparated(*v),
            SqlValue::Timestamp(v) => sep.push_bind_unseparated(*v),
            SqlValue::Json(v) => sep.push_bind_unseparated(v.clone()),
            SqlValue::I64(v) => sep.push_bind_unseparated(*v),
            SqlValue::I32(v) => sep.push_bind_unseparated(*v),
            SqlValue::Bool(v) => sep.push_bind_unseparated(*v),
            SqlValue::Null => sep.push_unseparated("NULL"),
        };
    }
}

/// `UPDATE <table> SET … WHERE id = ? AND version = ?`.
pub async fn update_by_version(
    tx: &mut Tx,
    table: &str,
    id: Uuid,
    expected_version: i64,
    updates: &[(&str, SqlValue)],
) -> Result<bool> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("update ");
    qb.push(table);
    qb.push(" set ");
    push_assignments(&mut qb, updates);
    qb.push(" where id = ");
    qb.push_bind(id);
    qb.push(" and version = ");
    qb.push_bind(expected_version);

    let res = qb
        .build()
        .execute(&mut **tx)
        .await
        .with_context(|| format!("update_by_version on {table} failed"))?;

    Ok(res.rows_affected() > 0)
}

/// `UPDATE <table> SET … WHERE id = ? AND status IN (…)`.
pub async fn update_by_status(
    tx: &mut Tx,
    table: &str,
    id: Uuid,
    allowed_statuses: &[&str],
    updates: &[(&str, SqlValue)],
) -> Result<bool> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("update ");
    qb.push(table);
    qb.push(" set ");
    push_assignments(&mut qb, updates);
    qb.push(" where id = ");
    qb.push_bind(id);
    qb.push(" and status in (");
    {
        let mut sep = qb.separated(", ");
        for s in allowed_statuses {
            sep.push_bind(s.to_string());
        }
    }
    qb.push(")");

    let res = qb
        .build()
        .execute(&mut **tx)
        .await
        .with_context(|| format!("update_by_status on {table} failed"))?;

    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Zero rows affected means a peer won the race.
pub fn require_cas_success(ok: bool, op: &str, msg: &str) -> CoreResult<()> {
    if ok {
        Ok(())
    } else {
        Err(CoreError::new(Code::Conflict, op, msg))
    }
}

/// Case-insensitive membership test over an allowed status set.
pub fn require_status_allowed(op: &str, current: &str, allowed: &[&str]) -> CoreResult<()> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(current)) {
        Ok(())
    } else {
        Err(CoreError::new(
            Code::Conflict,
            op,
            format!("status '{current}' not in allowed set {allowed:?}"),
        ))
    }
}

pub fn require_version_match(op: &str, current: i64, expected: i64) -> CoreResult<()> {
    if current == expected {
        Ok(())
    } else {
        Err(CoreError::new(
            Code::Conflict,
            op,
            format!("version mismatch: current={current} expected={expected}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_success_validator() {
        assert!(require_cas_success(true, "op", "msg").is_ok());
        let err = require_cas_success(false, "turn.mark_failed", "peer won").unwrap_err();
        assert_eq!(err.code(), Code::Conflict);
        assert_eq!(err.op(), "turn.mark_failed");
    }

    #[test]
    fn status_allowed_is_case_insensitive() {
        assert!(require_status_allowed("op", "Running", &["queued", "running"]).is_ok());
        assert_eq!(
            require_status_allowed("op", "done", &["queued", "running"])
                .unwrap_err()
                .code(),
            Code::Conflict
        );
    }

    #[test]
    fn version_match_validator() {
        assert!(require_version_match("op", 3, 3).is_ok());
        assert_eq!(
            require_version_match("op", 4, 3).unwrap_err().code(),
            Code::Conflict
        );
    }
}
