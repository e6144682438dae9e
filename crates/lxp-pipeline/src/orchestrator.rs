//! Pipeline orchestrator: drives a [`StageGraph`] for one entity.
//!
//! A stage is "done" when the latest job for `(owner, entity, job_type)`
//! is `done`. Progression is event-driven: every `Succeed` from a stage
//! handler calls back into [`PipelineOrchestrator::on_stage_succeeded`],
//! which enqueues any dependent whose dependencies are all done.
//! Wait-point stages are never auto-enqueued; an external signal settles
//! them. Every enqueue is debounced, so replays and racing callbacks do
//! not duplicate work.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use lxp_aggregates::{AppendAction, SagaAggregate, TransitionStatus};
use lxp_db::{jobs, SagaRow, SqlValue};
use lxp_errors::{map_err_code, Code, CoreError, CoreResult};
use lxp_schemas::{JobStatus, SagaStatus};

use crate::graph::{StageGraph, StageKind};

/// The entity a pipeline run operates on.
#[derive(Debug, Clone)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

pub struct PipelineOrchestrator {
    pool: PgPool,
    graph: StageGraph,
    sagas: SagaAggregate,
}

impl PipelineOrchestrator {
    pub fn new(pool: PgPool, graph: StageGraph) -> Self {
        let sagas = SagaAggregate::new(pool.clone());
        Self { pool, graph, sagas }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Kick off a run: enqueue every root stage (debounced).
    /// Returns the job ids actually inserted.
    pub async fn start(
        &self,
        owner_id: Uuid,
        entity: &EntityRef,
        payload: &Value,
    ) -> CoreResult<Vec<Uuid>> {
        let mut enqueued = Vec::new();
        for stage in self.graph.roots() {
            if stage.kind != StageKind::Job {
                continue;
            }
            if let Some(id) = self.enqueue_stage(owner_id, entity, &stage.job_type, payload).await? {
                enqueued.push(id);
            }
        }
        Ok(enqueued)
    }

    /// Callback for a stage handler's `Succeed`: enqueue each dependent
    /// whose dependencies are all done. Wait-points are skipped — they
    /// progress only through [`signal_wait_point`].
    ///
    /// [`signal_wait_point`]: PipelineOrchestrator::signal_wait_point
    pub async fn on_stage_succeeded(
        &self,
        owner_id: Uuid,
        entity: &EntityRef,
        stage_name: &str,
        payload: &Value,
    ) -> CoreResult<Vec<Uuid>> {
        let _ = self.graph.stage(stage_name).ok_or_else(|| {
            CoreError::new(
                Code::Validation,
                "pipeline.on_stage_succeeded",
                format!("unknown stage '{stage_name}'"),
            )
        })?;

        let mut enqueued = Vec::new();
        for dependent in self.graph.dependents_of(stage_name) {
            if dependent.kind != StageKind::Job {
                continue;
            }
            if !self.dependencies_done(owner_id, entity, &dependent.depends_on).await? {
                continue;
            }
            if let Some(id) = self
                .enqueue_stage(owner_id, entity, &dependent.job_type, payload)
                .await?
            {
                enqueued.push(id);
            }
        }
        Ok(enqueued)
    }

    /// External signal for a wait-point: records the stage as done and
    /// cascades to its dependents.
    pub async fn signal_wait_point(
        &self,
        owner_id: Uuid,
        entity: &EntityRef,
        stage_name: &str,
        payload: &Value,
    ) -> CoreResult<Vec<Uuid>> {
        const OP: &str = "pipeline.signal_wait_point";

        let stage = self.graph.stage(stage_name).ok_or_else(|| {
            CoreError::new(Code::Validation, OP, format!("unknown stage '{stage_name}'"))
        })?;
        if stage.kind != StageKind::WaitPoint {
            return Err(CoreError::new(
                Code::Validation,
                OP,
                format!("stage '{stage_name}' is not a wait-point"),
            ));
        }

        if !self.dependencies_done(owner_id, entity, &stage.depends_on).await? {
            return Err(CoreError::new(
                Code::PreconditionFailed,
                OP,
                format!("dependencies of wait-point '{stage_name}' are not all done"),
            ));
        }

        // The signal itself is the stage's completion record: a job row
        // settled directly to done, so dependency checks and debouncing
        // read it like any other stage.
        let job_id = jobs::enqueue(
            &self.pool,
            owner_id,
            &stage.job_type,
            Some(&entity.entity_type),
            Some(entity.entity_id),
            payload.clone(),
        )
        .await
        .map_err(|e| map_err_code(OP, e))?;

        if let Some(id) = job_id {
            jobs::update_fields(
                &self.pool,
                id,
                &[
                    ("status", SqlValue::Text("done".into())),
                    ("stage", SqlValue::Text("signaled".into())),
                ],
            )
            .await
            .map_err(|e| map_err_code(OP, e))?;
        }

        self.on_stage_succeeded(owner_id, entity, stage_name, payload)
            .await
    }

    /// Escalate a failed run to a compensation saga.
    ///
    /// Actions are appended while the saga is still `running` (appends are
    /// illegal afterwards), newest completed stage first, then the status
    /// walks `running -> failed -> compensating`. Compensation workers
    /// execute the actions and settle them; [`complete_compensation`]
    /// closes the saga.
    ///
    /// [`complete_compensation`]: PipelineOrchestrator::complete_compensation
    pub async fn escalate_failure(
        &self,
        owner_id: Uuid,
        root_job_id: Option<Uuid>,
        completed_stages: &[&str],
    ) -> CoreResult<SagaRow> {
        let saga = self.sagas.create(owner_id, root_job_id).await?;

        for stage_name in completed_stages.iter().rev() {
            let stage = self.graph.stage(stage_name).ok_or_else(|| {
                CoreError::new(
                    Code::Validation,
                    "pipeline.escalate_failure",
                    format!("unknown stage '{stage_name}'"),
                )
            })?;
            self.sagas
                .append_action(
                    AppendAction::new(saga.id, format!("undo_{}", stage.name)).with_payload(
                        serde_json::json!({
                            "stage": stage.name,
                            "job_type": stage.job_type,
                        }),
                    ),
                )
                .await?;
        }

        self.sagas
            .transition_status(
                TransitionStatus::new(saga.id, SagaStatus::Failed).from(SagaStatus::Running),
            )
            .await?;
        let saga = self
            .sagas
            .transition_status(
                TransitionStatus::new(saga.id, SagaStatus::Compensating).from(SagaStatus::Failed),
            )
            .await?;

        tracing::warn!(
            saga_id = %saga.id,
            stages = completed_stages.len(),
            "pipeline failure escalated to compensation saga"
        );

        Ok(saga)
    }

    /// Close a compensation saga once every action has settled.
    pub async fn complete_compensation(&self, saga_id: Uuid) -> CoreResult<SagaRow> {
        const OP: &str = "pipeline.complete_compensation";

        let pending = lxp_db::sagas::count_pending_actions(&self.pool, saga_id)
            .await
            .map_err(|e| map_err_code(OP, e))?;
        if pending > 0 {
            return Err(CoreError::new(
                Code::PreconditionFailed,
                OP,
                format!("{pending} compensation action(s) still pending"),
            ));
        }

        // No `from` precondition: closing an already-compensated saga is
        // an idempotent success.
        self.sagas
            .transition_status(TransitionStatus::new(saga_id, SagaStatus::Compensated))
            .await
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn dependencies_done(
        &self,
        owner_id: Uuid,
        entity: &EntityRef,
        deps: &[String],
    ) -> CoreResult<bool> {
        for dep in deps {
            let stage = self.graph.stage(dep).ok_or_else(|| {
                CoreError::new(
                    Code::Validation,
                    "pipeline.dependencies",
                    format!("unknown stage '{dep}'"),
                )
            })?;
            let latest = jobs::get_latest_by_entity(
                &self.pool,
                owner_id,
                &entity.entity_type,
                entity.entity_id,
                &stage.job_type,
            )
            .await
            .map_err(|e| map_err_code("pipeline.dependencies", e))?;

            match latest {
                Some(job) if job.status == JobStatus::Done => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Debounced enqueue: `None` when an equivalent job is already
    /// runnable.
    async fn enqueue_stage(
        &self,
        owner_id: Uuid,
        entity: &EntityRef,
        job_type: &str,
        payload: &Value,
    ) -> CoreResult<Option<Uuid>> {
        jobs::enqueue(
            &self.pool,
            owner_id,
            job_type,
            Some(&entity.entity_type),
            Some(entity.entity_id),
            payload.clone(),
        )
        .await
        .map_err(|e| map_err_code("pipeline.enqueue_stage", e))
    }
}
