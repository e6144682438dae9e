//! Shared wire/status types for the job-execution substrate.
//!
//! Status enums are stored as lowercase strings in Postgres and parsed
//! strictly on the way out; an unknown status in the database is a
//! `validation` failure rather than a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lxp_errors::{Code, CoreError, CoreResult};

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a [`job_run`] row.
///
/// `done` and `failed` are terminal except via explicit reset; `paused`
/// rows are parked by the freeze gate and require an explicit requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Failed,
    Done,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Done => "done",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            "done" => Ok(JobStatus::Done),
            "paused" => Ok(JobStatus::Paused),
            other => Err(CoreError::new(
                Code::Validation,
                "job_status.parse",
                format!("invalid job status: {other}"),
            )),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SagaStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a [`saga_run`] header. The allowed-transition graph is
/// enforced by the saga aggregate; this type only names the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Succeeded => "succeeded",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "running" => Ok(SagaStatus::Running),
            "succeeded" => Ok(SagaStatus::Succeeded),
            "failed" => Ok(SagaStatus::Failed),
            "compensating" => Ok(SagaStatus::Compensating),
            "compensated" => Ok(SagaStatus::Compensated),
            other => Err(CoreError::new(
                Code::Validation,
                "saga_status.parse",
                format!("invalid saga status: {other}"),
            )),
        }
    }

    /// Terminal states cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Succeeded | SagaStatus::Compensated)
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TurnStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a conversation turn (one user message + one assistant reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Queued => "queued",
            TurnStatus::Running => "running",
            TurnStatus::Done => "done",
            TurnStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "queued" => Ok(TurnStatus::Queued),
            "running" => Ok(TurnStatus::Running),
            "done" => Ok(TurnStatus::Done),
            "error" => Ok(TurnStatus::Error),
            other => Err(CoreError::new(
                Code::Validation,
                "turn_status.parse",
                format!("invalid turn status: {other}"),
            )),
        }
    }

    /// A turn can only be failed while queued or running.
    pub fn is_failable(&self) -> bool {
        matches!(self, TurnStatus::Queued | TurnStatus::Running)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Best-effort progress notification emitted by a running handler.
///
/// Delivery is lossy; clients reconcile from the canonical `job_run` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub stage: String,
    /// 0..=100, clamped at the emitter.
    pub pct: u8,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Messages broadcast over the worker event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress(ProgressEvent),
    Completed {
        job_id: Uuid,
        owner_id: Uuid,
        stage: String,
        at: DateTime<Utc>,
    },
    Failed {
        job_id: Uuid,
        owner_id: Uuid,
        stage: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Progress(_) => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Progress(p) => p.job_id,
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn owner_id(&self) -> Uuid {
        match self {
            JobEvent::Progress(p) => p.owner_id,
            JobEvent::Completed { owner_id, .. } | JobEvent::Failed { owner_id, .. } => *owner_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// Generic envelope around events that cross a process boundary.
///
/// The payload stays typed; the correlation/causation pair lets a
/// subscriber stitch one job's event stream back together (and tie a
/// child job's events to the parent that spawned it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub owner_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub topic: String,
    pub event_type: String,
    pub payload: T,
}

impl EventEnvelope<JobEvent> {
    /// Wrap a job event for the worker bus: the job id is the
    /// correlation, the parent job (when present) the causation.
    pub fn for_job(event: JobEvent, causation_id: Option<Uuid>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            owner_id: event.owner_id(),
            ts_utc: Utc::now(),
            correlation_id: event.job_id(),
            causation_id,
            topic: "jobs".to_string(),
            event_type: event.event_type().to_string(),
            payload: event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips() {
        for s in ["queued", "running", "failed", "done", "paused"] {
            assert_eq!(JobStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(JobStatus::parse("armed").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(SagaStatus::Succeeded.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
    }

    #[test]
    fn turn_failability() {
        assert!(TurnStatus::Queued.is_failable());
        assert!(TurnStatus::Running.is_failable());
        assert!(!TurnStatus::Done.is_failable());
        assert!(!TurnStatus::Error.is_failable());
    }

    #[test]
    fn job_event_serializes_tagged() {
        let ev = JobEvent::Completed {
            job_id: Uuid::nil(),
            owner_id: Uuid::nil(),
            stage: "finalize".into(),
            at: Utc::now(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "completed");
    }

    #[test]
    fn envelope_correlates_on_job_and_causes_on_parent() {
        let job_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        let parent = Uuid::new_v4();

        let env = EventEnvelope::for_job(
            JobEvent::Failed {
                job_id,
                owner_id,
                stage: "run".into(),
                error: "retryable: boom".into(),
                at: Utc::now(),
            },
            Some(parent),
        );

        assert_eq!(env.correlation_id, job_id);
        assert_eq!(env.owner_id, owner_id);
        assert_eq!(env.causation_id, Some(parent));
        assert_eq!(env.topic, "jobs");
        assert_eq!(env.event_type, "failed");
        assert_eq!(env.payload.job_id(), job_id);

        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["payload"]["type"], "failed");
        assert_eq!(v["event_type"], "failed");
    }
}
