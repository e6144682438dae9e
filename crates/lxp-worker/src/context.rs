//! Execution context handed to a handler for one claimed job.
//!
//! Settlement (`succeed` / `fail`) is sticky: the first call wins, later
//! calls are no-ops. That lets the pool apply its safety net without ever
//! double-settling a job the handler already settled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use lxp_db::{jobs, JobRow, SqlValue};
use lxp_errors::{map_err_code, Code, CoreError, CoreResult};
use lxp_schemas::{EventEnvelope, JobEvent, ProgressEvent};

pub(crate) fn clamp_pct(pct: u8) -> u8 {
    pct.min(100)
}

#[derive(Clone)]
pub struct ExecutionContext {
    pool: PgPool,
    job: JobRow,
    events: broadcast::Sender<EventEnvelope<JobEvent>>,
    cancel: watch::Receiver<bool>,
    settled: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub(crate) fn new(
        pool: PgPool,
        job: JobRow,
        events: broadcast::Sender<EventEnvelope<JobEvent>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            job,
            events,
            cancel,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job(&self) -> &JobRow {
        &self.job
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// Extract a UUID field from the payload.
    pub fn payload_uuid(&self, key: &str) -> CoreResult<Uuid> {
        let raw = self
            .payload()
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::new(
                    Code::Validation,
                    "worker.payload_uuid",
                    format!("payload field '{key}' missing or not a string"),
                )
            })?;
        raw.parse::<Uuid>().map_err(|_| {
            CoreError::new(
                Code::Validation,
                "worker.payload_uuid",
                format!("payload field '{key}' is not a valid uuid: {raw}"),
            )
        })
    }

    /// Resolves when the pool is shutting down. Handlers doing long work
    /// should select on this and return promptly.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Best-effort broadcast; subscribers that lag just miss events and
    /// reconcile from the job row.
    fn emit(&self, event: JobEvent) {
        let _ = self
            .events
            .send(EventEnvelope::for_job(event, self.job.parent_job_id));
    }

    /// Update the job's stage and emit a best-effort progress event.
    /// `pct` is clamped to 0..=100; loss of the event is tolerated —
    /// clients reconcile from the job row.
    pub async fn progress(&self, stage: &str, pct: u8, message: &str) -> CoreResult<()> {
        if self.is_settled() {
            return Ok(());
        }

        jobs::update_fields(
            &self.pool,
            self.job.id,
            &[("stage", SqlValue::Text(stage.to_string()))],
        )
        .await
        .map_err(|e| map_err_code("worker.progress", e))?;

        self.emit(JobEvent::Progress(ProgressEvent {
            job_id: self.job.id,
            owner_id: self.job.owner_id,
            stage: stage.to_string(),
            pct: clamp_pct(pct),
            message: message.to_string(),
            at: Utc::now(),
        }));

        Ok(())
    }

    /// Terminal success: persists the result, clears the lease, emits a
    /// completion event. No-op if the job was already settled.
    pub async fn succeed(&self, stage: &str, result: Value) -> CoreResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        jobs::update_fields(
            &self.pool,
            self.job.id,
            &[
                ("status", SqlValue::Text("done".into())),
                ("stage", SqlValue::Text(stage.to_string())),
                ("result", SqlValue::Json(result)),
                ("locked_at", SqlValue::Null),
                ("heartbeat_at", SqlValue::Null),
            ],
        )
        .await
        .map_err(|e| map_err_code("worker.succeed", e))?;

        self.emit(JobEvent::Completed {
            job_id: self.job.id,
            owner_id: self.job.owner_id,
            stage: stage.to_string(),
            at: Utc::now(),
        });

        Ok(())
    }

    /// Terminal failure for this attempt: records the error, clears the
    /// lease. The job re-enters the claim pool after `retry_delay` while
    /// attempts remain. No-op if the job was already settled.
    pub async fn fail(&self, stage: &str, err: &CoreError) -> CoreResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let last_error = format!("{}: {}", err.code(), err);

        jobs::update_fields(
            &self.pool,
            self.job.id,
            &[
                ("status", SqlValue::Text("failed".into())),
                ("stage", SqlValue::Text(stage.to_string())),
                ("last_error", SqlValue::Text(last_error.clone())),
                ("last_error_at", SqlValue::Timestamp(Utc::now())),
                ("locked_at", SqlValue::Null),
                ("heartbeat_at", SqlValue::Null),
            ],
        )
        .await
        .map_err(|e| map_err_code("worker.fail", e))?;

        self.emit(JobEvent::Failed {
            job_id: self.job.id,
            owner_id: self.job.owner_id,
            stage: stage.to_string(),
            error: last_error,
            at: Utc::now(),
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pct_clamps_to_100() {
        assert_eq!(clamp_pct(0), 0);
        assert_eq!(clamp_pct(100), 100);
        assert_eq!(clamp_pct(250), 100);
    }
}
