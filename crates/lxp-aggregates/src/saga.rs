//! Saga aggregate: append-only action log with a guarded status machine.
//!
//! # State diagram
//!
//! ```text
//!              ┌──► succeeded (terminal)
//!   running ───┼──► failed ──► compensating ──► compensated (terminal)
//!              └──► compensating ◄──┘   │
//!                        ▲             ▼
//!                        └────────── failed
//! ```
//!
//! Appends are only legal while the header is `running`; both appenders
//! and transition callers serialize on the header row lock, which is what
//! makes `seq` contiguous under concurrency.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use lxp_db::{sagas, NewSagaAction, SagaActionRow, SagaRow, Tx};
use lxp_errors::{Code, CoreError, CoreResult};
use lxp_schemas::SagaStatus;

use crate::base::{execute_write, AggregateContract, Hooks, TracingHooks};

/// Legal edges of the saga status machine.
pub fn transition_allowed(from: SagaStatus, to: SagaStatus) -> bool {
    use SagaStatus::*;
    matches!(
        (from, to),
        (Running, Succeeded)
            | (Running, Failed)
            | (Running, Compensating)
            | (Failed, Compensating)
            | (Compensating, Compensated)
            | (Compensating, Failed)
    )
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppendAction {
    pub saga_id: Uuid,
    /// Normalized to lowercase + trimmed; must be non-empty.
    pub kind: String,
    /// Must be a JSON object when present; `None` defaults to `{}`.
    pub payload: Option<Value>,
    /// Auto-generated when absent.
    pub action_id: Option<Uuid>,
    /// Defaults to now UTC.
    pub at: Option<DateTime<Utc>>,
}

impl AppendAction {
    pub fn new(saga_id: Uuid, kind: impl Into<String>) -> Self {
        Self {
            saga_id,
            kind: kind.into(),
            payload: None,
            action_id: None,
            at: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransitionStatus {
    pub saga_id: Uuid,
    pub to: SagaStatus,
    /// Optimistic precondition; `conflict` when it no longer matches.
    pub expected_from: Option<SagaStatus>,
    /// Defaults to now UTC.
    pub at: Option<DateTime<Utc>>,
}

impl TransitionStatus {
    pub fn new(saga_id: Uuid, to: SagaStatus) -> Self {
        Self {
            saga_id,
            to,
            expected_from: None,
            at: None,
        }
    }

    pub fn from(mut self, expected: SagaStatus) -> Self {
        self.expected_from = Some(expected);
        self
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

/// Append one action under the header lock. Public so callers with their
/// own transaction discipline (and tests injecting a failing runner) can
/// compose it.
pub async fn append_action_in_tx(
    tx: &mut Tx,
    input: &AppendAction,
) -> anyhow::Result<SagaActionRow> {
    let kind = input.kind.trim().to_lowercase();
    if kind.is_empty() {
        return Err(CoreError::new(
            Code::Validation,
            "saga.append_action",
            "action kind must be non-empty",
        )
        .into());
    }

    let payload = match &input.payload {
        None => Value::Object(Default::default()),
        Some(v) if v.is_object() => v.clone(),
        Some(other) => {
            return Err(CoreError::new(
                Code::Validation,
                "saga.append_action",
                format!("payload must be a JSON object, got {other}"),
            )
            .into());
        }
    };

    let saga = sagas::lock_saga(tx, input.saga_id).await?.ok_or_else(|| {
        CoreError::new(
            Code::NotFound,
            "saga.append_action",
            format!("saga {} not found", input.saga_id),
        )
    })?;

    if saga.status != SagaStatus::Running {
        return Err(CoreError::new(
            Code::InvariantViolation,
            "saga.append_action",
            format!("cannot append action to saga in status '{}'", saga.status),
        )
        .into());
    }

    let seq = sagas::next_action_seq(tx, input.saga_id).await?;
    let at = input.at.unwrap_or_else(Utc::now);

    let action = sagas::insert_action(
        tx,
        &NewSagaAction {
            id: input.action_id.unwrap_or_else(Uuid::new_v4),
            saga_id: input.saga_id,
            seq,
            kind,
            payload,
            at,
        },
    )
    .await?;

    Ok(action)
}

/// Guarded status transition under the header lock.
pub async fn transition_status_in_tx(
    tx: &mut Tx,
    input: &TransitionStatus,
) -> anyhow::Result<SagaRow> {
    let saga = sagas::lock_saga(tx, input.saga_id).await?.ok_or_else(|| {
        CoreError::new(
            Code::NotFound,
            "saga.transition_status",
            format!("saga {} not found", input.saga_id),
        )
    })?;

    if let Some(expected) = input.expected_from {
        if expected != saga.status {
            return Err(CoreError::new(
                Code::Conflict,
                "saga.transition_status",
                format!(
                    "expected status '{expected}' but saga is '{}'",
                    saga.status
                ),
            )
            .into());
        }
    }

    // Idempotent: already there.
    if saga.status == input.to {
        return Ok(saga);
    }

    if !transition_allowed(saga.status, input.to) {
        return Err(CoreError::new(
            Code::InvariantViolation,
            "saga.transition_status",
            format!("transition '{}' -> '{}' not allowed", saga.status, input.to),
        )
        .into());
    }

    let at = input.at.unwrap_or_else(Utc::now);
    sagas::set_saga_status(tx, input.saga_id, input.to, at).await?;

    Ok(SagaRow {
        status: input.to,
        updated_at: at,
        ..saga
    })
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SagaAggregate {
    pool: PgPool,
    hooks: Arc<dyn Hooks>,
}

impl SagaAggregate {
    pub fn new(pool: PgPool) -> Self {
        Self::with_hooks(pool, Arc::new(TracingHooks))
    }

    pub fn with_hooks(pool: PgPool, hooks: Arc<dyn Hooks>) -> Self {
        Self { pool, hooks }
    }

    pub fn contract() -> AggregateContract {
        AggregateContract {
            name: "saga",
            write_policy: "aggregate opens one transaction per call; header row lock first",
            read_policy: "reads outside the write path are pool-level and lock-free",
            notes: "action seq is contiguous per saga; appends only while running",
        }
    }

    pub async fn create(&self, owner_id: Uuid, root_job_id: Option<Uuid>) -> CoreResult<SagaRow> {
        execute_write(&self.pool, self.hooks.as_ref(), "saga.create", move |tx| {
            Box::pin(async move { sagas::create_saga(tx, owner_id, root_job_id).await })
        })
        .await
    }

    pub async fn append_action(&self, input: AppendAction) -> CoreResult<SagaActionRow> {
        execute_write(
            &self.pool,
            self.hooks.as_ref(),
            "saga.append_action",
            move |tx| Box::pin(async move { append_action_in_tx(tx, &input).await }),
        )
        .await
    }

    pub async fn transition_status(&self, input: TransitionStatus) -> CoreResult<SagaRow> {
        execute_write(
            &self.pool,
            self.hooks.as_ref(),
            "saga.transition_status",
            move |tx| Box::pin(async move { transition_status_in_tx(tx, &input).await }),
        )
        .await
    }

    /// Observability read: actions newest-first.
    pub async fn list_actions_desc(&self, saga_id: Uuid) -> CoreResult<Vec<SagaActionRow>> {
        sagas::list_actions_desc(&self.pool, saga_id)
            .await
            .map_err(|e| lxp_errors::map_err_code("saga.list_actions", e))
    }

    pub async fn get(&self, saga_id: Uuid) -> CoreResult<Option<SagaRow>> {
        sagas::get_saga(&self.pool, saga_id)
            .await
            .map_err(|e| lxp_errors::map_err_code("saga.get", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use SagaStatus::*;
        for to in [Running, Succeeded, Failed, Compensating, Compensated] {
            assert!(!transition_allowed(Succeeded, to));
            assert!(!transition_allowed(Compensated, to));
        }
    }

    #[test]
    fn allowed_edges_match_the_table() {
        use SagaStatus::*;
        assert!(transition_allowed(Running, Succeeded));
        assert!(transition_allowed(Running, Failed));
        assert!(transition_allowed(Running, Compensating));
        assert!(transition_allowed(Failed, Compensating));
        assert!(transition_allowed(Compensating, Compensated));
        assert!(transition_allowed(Compensating, Failed));

        assert!(!transition_allowed(Failed, Running));
        assert!(!transition_allowed(Failed, Succeeded));
        assert!(!transition_allowed(Compensating, Succeeded));
        assert!(!transition_allowed(Running, Compensated));
    }

    #[test]
    fn contract_is_stable() {
        let c = SagaAggregate::contract();
        assert_eq!(c.name, "saga");
        assert!(c.write_policy.contains("one transaction"));
    }
}
