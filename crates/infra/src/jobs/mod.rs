//! Durable job queue and the worker pool that drains it.
//!
//! ## Design
//!
//! - Jobs are typed, carry an opaque JSON payload and may belong to a run
//! - Claiming is atomic: concurrent workers never receive the same job
//! - Retryable failures are rescheduled with exponential backoff
//! - A job that uses up `max_attempts` executions is parked as `dead`
//!
//! ## Components
//!
//! - `Job`: the persisted record and its state transitions
//! - `JobRepository`: storage seam (in-memory, or Postgres behind the `postgres` feature)
//! - `JobQueue`: enqueue/claim/ack/retry/fail/requeue over a repository
//! - `WorkerPool`: threads running claim → execute → record

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobRepository;
pub use queue::{JobQueue, JobQueueError};
pub use store::{InMemoryJobRepository, JobRepository, JobStats, JobStoreError, StatusGuard};
pub use types::{
    BackoffPolicy, Job, JobId, JobOutcome, JobStatus, RetryOutcome, RunId, TransitionError,
    WorkerId,
};
pub use worker::{
    Disposition, HandlerRegistry, JobHandler, ProcessedJob, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolHandle, WorkerPoolStats,
};
