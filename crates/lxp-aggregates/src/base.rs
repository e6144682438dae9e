//! Shared machinery for aggregate write operations.
//!
//! `execute_write` is the single chokepoint: transaction scope, one-time
//! error classification, and observability events all happen here, so the
//! aggregates themselves only contain invariant logic.

use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::future::BoxFuture;
use sqlx::PgPool;

use lxp_db::{in_tx, Tx};
use lxp_errors::{map_err_code, Code, CoreResult};

// ---------------------------------------------------------------------------
// Contract descriptor
// ---------------------------------------------------------------------------

/// Stable description of an aggregate's write discipline. Surfaced for
/// operability docs and asserted in tests so drift is visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateContract {
    pub name: &'static str,
    /// Who opens the write transaction for this aggregate's tables.
    pub write_policy: &'static str,
    /// How reads outside the write path behave.
    pub read_policy: &'static str,
    pub notes: &'static str,
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Observability sink for aggregate operations.
pub trait Hooks: Send + Sync {
    fn observe_operation(&self, op: &str, status: &str, elapsed: Duration);
    fn inc_conflict(&self, op: &str);
    fn inc_retry(&self, op: &str);
}

/// Default sink: structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHooks;

impl Hooks for TracingHooks {
    fn observe_operation(&self, op: &str, status: &str, elapsed: Duration) {
        if status == "success" {
            tracing::debug!(op, status, elapsed_ms = elapsed.as_millis() as u64, "aggregate write");
        } else {
            tracing::warn!(op, status, elapsed_ms = elapsed.as_millis() as u64, "aggregate write failed");
        }
    }

    fn inc_conflict(&self, op: &str) {
        tracing::debug!(op, "aggregate conflict");
    }

    fn inc_retry(&self, op: &str) {
        tracing::debug!(op, "aggregate retryable failure");
    }
}

/// Substitute when a caller wires no hooks at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl Hooks for NoopHooks {
    fn observe_operation(&self, _op: &str, _status: &str, _elapsed: Duration) {}
    fn inc_conflict(&self, _op: &str) {}
    fn inc_retry(&self, _op: &str) {}
}

// ---------------------------------------------------------------------------
// execute_write
// ---------------------------------------------------------------------------

/// Run `body` inside one transaction, classify the raw error exactly once,
/// and emit observability events. The returned error is already typed; the
/// worker must not re-classify it.
pub async fn execute_write<T, F>(
    pool: &PgPool,
    hooks: &dyn Hooks,
    op: &'static str,
    body: F,
) -> CoreResult<T>
where
    F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T>>,
{
    let start = Instant::now();

    match in_tx(pool, body).await {
        Ok(val) => {
            hooks.observe_operation(op, "success", start.elapsed());
            Ok(val)
        }
        Err(err) => {
            let mapped = map_err_code(op, err);
            hooks.observe_operation(op, mapped.code().as_str(), start.elapsed());
            match mapped.code() {
                Code::Conflict => hooks.inc_conflict(op),
                Code::Retryable => hooks.inc_retry(op),
                _ => {}
            }
            Err(mapped)
        }
    }
}
