//! Thread aggregate: invariant-heavy writes on chat threads, messages,
//! and turns.
//!
//! The representative operation is `mark_turn_failed`: it atomically
//! fails a turn and its assistant message, with a CAS on the turn status
//! so exactly one of several concurrent markers wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use lxp_db::chat::{self, MessageRow, NewMessage, ThreadRow, TurnRow};
use lxp_db::{require_cas_success, Tx};
use lxp_errors::{Code, CoreError, CoreResult};
use lxp_schemas::TurnStatus;

use crate::base::{execute_write, AggregateContract, Hooks, TracingHooks};

pub const DEFAULT_FAILURE_CODE: &str = "chat_respond_failed";

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MarkTurnFailed {
    pub owner_id: Uuid,
    pub thread_id: Uuid,
    pub turn_id: Uuid,
    pub job_id: Option<Uuid>,
    /// Defaults to [`DEFAULT_FAILURE_CODE`].
    pub failure_code: Option<String>,
    pub failure_cause: String,
    /// Defaults to now UTC.
    pub at: Option<DateTime<Utc>>,
    /// Caller-supplied trace fields, merged over the reserved keys.
    pub metadata: Map<String, Value>,
}

impl MarkTurnFailed {
    pub fn new(owner_id: Uuid, thread_id: Uuid, turn_id: Uuid, cause: impl Into<String>) -> Self {
        Self {
            owner_id,
            thread_id,
            turn_id,
            job_id: None,
            failure_code: None,
            failure_cause: cause.into(),
            at: None,
            metadata: Map::new(),
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppendMessage {
    pub owner_id: Uuid,
    pub thread_id: Uuid,
    pub role: String,
    pub content: String,
    /// Defaults to "complete".
    pub status: Option<String>,
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

fn compose_trace(input: &MarkTurnFailed) -> Value {
    let mut trace = Map::new();
    trace.insert(
        "failure_code".into(),
        Value::String(
            input
                .failure_code
                .clone()
                .unwrap_or_else(|| DEFAULT_FAILURE_CODE.to_string()),
        ),
    );
    trace.insert(
        "failure_cause".into(),
        Value::String(input.failure_cause.clone()),
    );
    if let Some(job_id) = input.job_id {
        trace.insert("job_id".into(), Value::String(job_id.to_string()));
    }
    for (k, v) in &input.metadata {
        trace.insert(k.clone(), v.clone());
    }
    Value::Object(trace)
}

pub async fn mark_turn_failed_in_tx(tx: &mut Tx, input: &MarkTurnFailed) -> anyhow::Result<()> {
    const OP: &str = "thread.mark_turn_failed";

    let thread = chat::lock_thread_owned(tx, input.thread_id, input.owner_id)
        .await?
        .ok_or_else(|| {
            CoreError::new(Code::NotFound, OP, format!("thread {} not found", input.thread_id))
        })?;

    let turn = chat::get_turn(tx, input.turn_id).await?.ok_or_else(|| {
        CoreError::new(Code::NotFound, OP, format!("turn {} not found", input.turn_id))
    })?;

    if turn.thread_id != thread.id {
        return Err(
            CoreError::new(Code::InvariantViolation, OP, "turn does not belong to thread").into(),
        );
    }

    match turn.status {
        TurnStatus::Error => {
            return Err(CoreError::new(Code::Conflict, OP, "turn already failed").into());
        }
        s if !s.is_failable() => {
            return Err(CoreError::new(
                Code::InvariantViolation,
                OP,
                format!("turn in status '{s}' cannot be failed"),
            )
            .into());
        }
        _ => {}
    }

    let at = input.at.unwrap_or_else(Utc::now);
    let trace = compose_trace(input);

    // The race point: concurrent markers serialize here and exactly one
    // affects the row.
    let won = chat::mark_turn_error_cas(tx, input.turn_id, &trace, input.job_id, at).await?;
    require_cas_success(won, OP, "turn already failed")?;

    if let Some(assistant_id) = turn.assistant_message_id {
        chat::mark_message_error(tx, assistant_id, &trace, at).await?;
    }

    Ok(())
}

async fn append_message_in_tx(tx: &mut Tx, input: &AppendMessage) -> anyhow::Result<MessageRow> {
    const OP: &str = "thread.append_message";

    let role = input.role.trim().to_lowercase();
    if role.is_empty() {
        return Err(CoreError::new(Code::Validation, OP, "message role must be non-empty").into());
    }

    let thread = chat::lock_thread_owned(tx, input.thread_id, input.owner_id)
        .await?
        .ok_or_else(|| {
            CoreError::new(Code::NotFound, OP, format!("thread {} not found", input.thread_id))
        })?;

    let seq = chat::next_message_seq(tx, thread.id).await?;

    let msg = chat::insert_message(
        tx,
        &NewMessage {
            thread_id: thread.id,
            seq,
            role,
            content: input.content.clone(),
            status: input
                .status
                .clone()
                .unwrap_or_else(|| "complete".to_string()),
            metadata: if input.metadata.is_object() {
                input.metadata.clone()
            } else {
                Value::Object(Default::default())
            },
        },
    )
    .await?;

    Ok(msg)
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ThreadAggregate {
    pool: PgPool,
    hooks: Arc<dyn Hooks>,
}

impl ThreadAggregate {
    pub fn new(pool: PgPool) -> Self {
        Self::with_hooks(pool, Arc::new(TracingHooks))
    }

    pub fn with_hooks(pool: PgPool, hooks: Arc<dyn Hooks>) -> Self {
        Self { pool, hooks }
    }

    pub fn contract() -> AggregateContract {
        AggregateContract {
            name: "thread",
            write_policy: "aggregate opens one transaction per call; thread row lock first",
            read_policy: "reads outside the write path are pool-level and lock-free",
            notes: "message seq is contiguous per thread; turn failure is CAS-guarded",
        }
    }

    pub async fn create_thread(&self, owner_id: Uuid, title: &str) -> CoreResult<ThreadRow> {
        let title = title.to_string();
        execute_write(&self.pool, self.hooks.as_ref(), "thread.create", move |tx| {
            Box::pin(async move { chat::create_thread(tx, owner_id, &title).await })
        })
        .await
    }

    pub async fn append_message(&self, input: AppendMessage) -> CoreResult<MessageRow> {
        execute_write(
            &self.pool,
            self.hooks.as_ref(),
            "thread.append_message",
            move |tx| Box::pin(async move { append_message_in_tx(tx, &input).await }),
        )
        .await
    }

    /// Create a turn linking an existing user message (and optionally an
    /// assistant placeholder) in status `queued`.
    pub async fn create_turn(
        &self,
        owner_id: Uuid,
        thread_id: Uuid,
        user_message_id: Uuid,
        assistant_message_id: Option<Uuid>,
    ) -> CoreResult<TurnRow> {
        execute_write(
            &self.pool,
            self.hooks.as_ref(),
            "thread.create_turn",
            move |tx| {
                Box::pin(async move {
                    let thread = chat::lock_thread_owned(tx, thread_id, owner_id)
                        .await?
                        .ok_or_else(|| {
                            CoreError::new(
                                Code::NotFound,
                                "thread.create_turn",
                                format!("thread {thread_id} not found"),
                            )
                        })?;

                    let turn = chat::create_turn(
                        tx,
                        thread.id,
                        user_message_id,
                        assistant_message_id,
                        TurnStatus::Queued,
                    )
                    .await?;
                    Ok(turn)
                })
            },
        )
        .await
    }

    /// Atomically mark a turn (and its assistant message) failed.
    /// Exactly one of several concurrent callers succeeds; the rest see
    /// `conflict`.
    pub async fn mark_turn_failed(&self, input: MarkTurnFailed) -> CoreResult<()> {
        execute_write(
            &self.pool,
            self.hooks.as_ref(),
            "thread.mark_turn_failed",
            move |tx| Box::pin(async move { mark_turn_failed_in_tx(tx, &input).await }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_merges_reserved_keys_then_caller_metadata() {
        let mut input = MarkTurnFailed::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "upstream timeout",
        )
        .with_job(Uuid::nil());
        input
            .metadata
            .insert("retrieval_ms".into(), Value::from(412));

        let trace = compose_trace(&input);
        assert_eq!(trace["failure_code"], DEFAULT_FAILURE_CODE);
        assert_eq!(trace["failure_cause"], "upstream timeout");
        assert_eq!(trace["job_id"], Uuid::nil().to_string());
        assert_eq!(trace["retrieval_ms"], 412);
    }

    #[test]
    fn caller_metadata_wins_on_duplicate_keys() {
        let mut input =
            MarkTurnFailed::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "cause");
        input
            .metadata
            .insert("failure_code".into(), Value::from("custom_code"));

        let trace = compose_trace(&input);
        assert_eq!(trace["failure_code"], "custom_code");
    }

    #[test]
    fn contract_is_stable() {
        let c = ThreadAggregate::contract();
        assert_eq!(c.name, "thread");
        assert!(c.notes.contains("CAS"));
    }
}
