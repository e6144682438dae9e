//! Worker pool: N poll loops over the claim query.
//!
//! Each worker ticks (~1 s), claims at most one job, and runs it to
//! settlement behind a panic barrier. A per-job heartbeat task renews the
//! lease while the handler runs. Shutdown is a watch channel: the poll
//! loops exit at the next tick and in-flight handlers observe
//! `ctx.cancelled()`.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use lxp_config::WorkerSettings;
use lxp_db::{freeze, jobs, ClaimParams, JobRow, SqlValue};
use lxp_errors::{Code, CoreError};
use lxp_schemas::{EventEnvelope, JobEvent, JobStatus};

use crate::context::ExecutionContext;
use crate::registry::HandlerRegistry;

pub struct WorkerPool {
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    events: broadcast::Sender<EventEnvelope<JobEvent>>,
}

/// Running pool: keep it around to shut down cleanly.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for every poll loop to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl WorkerPool {
    pub fn new(pool: PgPool, registry: Arc<HandlerRegistry>, settings: WorkerSettings) -> Self {
        settings.validate();
        let (events, _) = broadcast::channel(1024);
        Self {
            pool,
            registry,
            settings,
            events,
        }
    }

    /// Subscribe to best-effort job events (progress, completion,
    /// failure), each wrapped in an [`EventEnvelope`] correlated on the
    /// job id.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<JobEvent>> {
        self.events.subscribe()
    }

    /// Spawn `max(1, concurrency)` poll loops.
    pub fn start(&self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = self.settings.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|idx| {
                let worker = Worker {
                    idx,
                    pool: self.pool.clone(),
                    registry: Arc::clone(&self.registry),
                    settings: self.settings.clone(),
                    events: self.events.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(concurrency, "worker pool started");

        WorkerHandle {
            shutdown_tx,
            workers,
        }
    }
}

struct Worker {
    idx: usize,
    pool: PgPool,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    events: broadcast::Sender<EventEnvelope<JobEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    fn claim_params(&self) -> ClaimParams {
        ClaimParams {
            max_attempts: self.settings.max_attempts,
            retry_delay: self.settings.retry_delay,
            stale_running: self.settings.stale_running,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::debug!(worker = self.idx, "worker exiting on shutdown");
                        return;
                    }
                }
                _ = tick.tick() => {}
            }

            let claimed = match jobs::claim_next_runnable(&self.pool, self.claim_params()).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::warn!(worker = self.idx, error = %err, "claim failed");
                    continue;
                }
            };

            let Some(job) = claimed else { continue };
            self.process(job).await;
        }
    }

    async fn process(&self, job: JobRow) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        // Pause gate: frozen job types are parked, not run. The guarded
        // update refuses terminal rows, so a racing settle is never
        // overwritten.
        if self.settings.frozen_job_types.iter().any(|t| t == &job_type) {
            match freeze::freeze_active(&self.pool).await {
                Ok(true) => {
                    if let Err(err) = jobs::update_fields_unless_status(
                        &self.pool,
                        job_id,
                        &[JobStatus::Done, JobStatus::Failed],
                        &[
                            ("status", SqlValue::Text("paused".into())),
                            (
                                "last_error",
                                SqlValue::Text(
                                    "paused: platform freeze is active for this job type".into(),
                                ),
                            ),
                            ("locked_at", SqlValue::Null),
                            ("heartbeat_at", SqlValue::Null),
                        ],
                    )
                    .await
                    {
                        tracing::warn!(%job_id, error = %err, "pause gate update failed");
                    }
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(%job_id, error = %err, "freeze lookup failed; running anyway");
                }
            }
        }

        let ctx = ExecutionContext::new(
            self.pool.clone(),
            job,
            self.events.clone(),
            self.shutdown.clone(),
        );

        let Some(handler) = self.registry.resolve(&job_type) else {
            let err = CoreError::new(
                Code::Internal,
                "worker.dispatch",
                format!("no handler registered for job type '{job_type}'"),
            );
            if let Err(fail_err) = ctx.fail("dispatch", &err).await {
                tracing::error!(%job_id, error = %fail_err, "failed to settle undispatchable job");
            }
            return;
        };

        let heartbeat = self.spawn_heartbeat(job_id);

        // Panic barrier: the handler runs in its own task so a panic
        // surfaces as a JoinError instead of taking the worker down.
        let handler_ctx = ctx.clone();
        let outcome =
            tokio::spawn(async move { handler.run(handler_ctx).await }).await;

        heartbeat.abort();

        match outcome {
            Ok(Ok(())) => {
                // Handler authority: it normally settles itself. A clean
                // return without settlement still releases the lease.
                if !ctx.is_settled() {
                    if let Err(err) = ctx.succeed("run", Value::Null).await {
                        tracing::error!(%job_id, error = %err, "failed to settle returned job");
                    }
                }
            }
            Ok(Err(run_err)) => {
                if !ctx.is_settled() {
                    if let Err(err) = ctx.fail("run", &run_err).await {
                        tracing::error!(%job_id, error = %err, "failed to settle failed job");
                    }
                }
            }
            Err(join_err) => {
                let panic_err = if join_err.is_panic() {
                    CoreError::new(
                        Code::Internal,
                        "worker.panic",
                        format!("handler panicked: {join_err}"),
                    )
                } else {
                    CoreError::new(
                        Code::Retryable,
                        "worker.panic",
                        format!("handler task aborted: {join_err}"),
                    )
                };
                if let Err(err) = ctx.fail("panic", &panic_err).await {
                    tracing::error!(%job_id, error = %err, "failed to settle panicked job");
                }
            }
        }
    }

    /// Renew the lease until aborted. The interval skips the immediate
    /// first tick so a fast handler never races its own claim stamp.
    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let interval = self.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // consume the immediate tick
            loop {
                tick.tick().await;
                if let Err(err) = jobs::heartbeat(&pool, job_id).await {
                    tracing::warn!(%job_id, error = %err, "heartbeat failed");
                }
            }
        })
    }
}
