//! Worker pool, handler registry, and execution context.
//!
//! The database is the only coordination point: claims, leases, and
//! heartbeats all live on the `job_run` row. Worker tasks inside one
//! process scale with `WORKER_CONCURRENCY`; across processes, the claim
//! query's `SKIP LOCKED` keeps workers from ever sharing a job.

pub mod context;
pub mod pool;
pub mod registry;

pub use context::ExecutionContext;
pub use pool::{WorkerHandle, WorkerPool};
pub use registry::{HandlerRegistry, JobHandler};
