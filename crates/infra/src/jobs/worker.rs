//! Worker pool: a fixed set of threads running claim → execute → record.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, JobQueueError};
use super::store::{JobRepository, JobStoreError};
use super::types::{BackoffPolicy, Job, JobId, JobOutcome, RetryOutcome, WorkerId};

/// Job handler function type.
pub type JobHandler = Arc<dyn Fn(&Job) -> JobOutcome + Send + Sync>;

/// Tries at writing one outcome before the claim is handed back.
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const OUTCOME_WRITE_BACKOFF: Duration = Duration::from_millis(20);

/// Maps job types to handlers.
///
/// Lookup order: exact type, then the longest matching category pattern
/// (`"press.*"` matches `"press.score"`), then the wildcard `"*"`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type or pattern. Replaces any previous one.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Job) -> JobOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    /// Get the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && job_type.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler);
        }

        self.handlers.get("*")
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Thread name prefix and worker id prefix
    pub name: String,
    /// Number of worker threads
    pub concurrency: usize,
    /// Idle sleep between empty claims
    pub poll_interval: Duration,
    /// Delay policy for retryable failures
    pub backoff: BackoffPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Worker pool error.
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("invalid worker pool config: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerPoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead: u64,
    pub current_running: usize,
}

/// Where a processed job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    RetryScheduled {
        attempt: u32,
        scheduled_at: DateTime<Utc>,
    },
    Dead {
        attempt: u32,
    },
}

impl From<RetryOutcome> for Disposition {
    fn from(outcome: RetryOutcome) -> Self {
        match outcome {
            RetryOutcome::Scheduled {
                attempt,
                scheduled_at,
            } => Disposition::RetryScheduled {
                attempt,
                scheduled_at,
            },
            RetryOutcome::Exhausted { attempt } => Disposition::Dead { attempt },
        }
    }
}

/// One job taken through claim → execute → record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub disposition: Disposition,
}

#[derive(Debug, Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`; returns `true` if shutdown was requested.
    fn idle(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    shutdown: Arc<Shutdown>,
    joins: Vec<thread::JoinHandle<()>>,
    worker_ids: Vec<WorkerId>,
    stats: Arc<Mutex<WorkerPoolStats>>,
    release_claims: Option<Box<dyn FnOnce(&[WorkerId]) + Send>>,
}

impl WorkerPoolHandle {
    /// Ask every worker to finish its current job and exit, then wait for them.
    ///
    /// In-flight handlers are never interrupted. Once every thread has exited,
    /// any job still claimed by one of this pool's workers is released.
    pub fn stop(mut self) {
        self.shutdown.signal();
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                error!("job worker thread panicked");
            }
        }
        if let Some(release) = self.release_claims.take() {
            release(&self.worker_ids);
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }
}

impl std::fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolHandle")
            .field("worker_ids", &self.worker_ids)
            .field("running", &self.joins.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        // Without an explicit stop the threads are detached but still told to exit.
        self.shutdown.signal();
    }
}

/// A fixed-size set of workers sharing one queue and one handler registry.
pub struct WorkerPool<R: JobRepository> {
    queue: Arc<JobQueue<R>>,
    handlers: HandlerRegistry,
    stats: Arc<Mutex<WorkerPoolStats>>,
}

impl<R: JobRepository + 'static> WorkerPool<R> {
    pub fn new(queue: Arc<JobQueue<R>>, handlers: HandlerRegistry) -> Self {
        Self {
            queue,
            handlers,
            stats: Arc::new(Mutex::new(WorkerPoolStats::default())),
        }
    }

    /// Spawn `config.concurrency` worker threads.
    ///
    /// Workers are named `{config.name}-{index}`. Jobs still claimed under
    /// those ids belong to an earlier run of this pool that never recorded
    /// an outcome, so they are released before any worker starts.
    pub fn start(self, config: WorkerPoolConfig) -> Result<WorkerPoolHandle, WorkerPoolError> {
        if config.concurrency == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let worker_ids: Vec<_> = (0..config.concurrency)
            .map(|index| WorkerId::for_unit(&config.name, index))
            .collect();
        if let Err(e) = self.queue.release_claims(&worker_ids) {
            warn!(pool = %config.name, error = %e, "failed to release stale job claims");
        }

        let pool = Arc::new(self);
        let shutdown = Arc::new(Shutdown::default());
        let config = Arc::new(config);
        let queue = pool.queue.clone();
        let mut handle = WorkerPoolHandle {
            shutdown: shutdown.clone(),
            joins: Vec::with_capacity(config.concurrency),
            worker_ids: Vec::with_capacity(config.concurrency),
            stats: pool.stats.clone(),
            release_claims: Some(Box::new(move |ids: &[WorkerId]| {
                if let Err(e) = queue.release_claims(ids) {
                    warn!(error = %e, "failed to release job claims on stop");
                }
            })),
        };

        for worker_id in worker_ids {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            let config = config.clone();
            let id = worker_id.clone();

            // On spawn failure `handle` drops here and signals the started workers.
            let join = thread::Builder::new()
                .name(worker_id.to_string())
                .spawn(move || pool.worker_loop(&id, &config, &shutdown))?;

            handle.joins.push(join);
            handle.worker_ids.push(worker_id);
        }

        info!(pool = %config.name, concurrency = config.concurrency, "worker pool started");
        Ok(handle)
    }

    /// Claim and process at most one job on the calling thread.
    pub fn run_once(
        &self,
        worker_id: &WorkerId,
        backoff: &BackoffPolicy,
    ) -> Result<Option<ProcessedJob>, JobQueueError> {
        let Some(job) = self.queue.claim(worker_id)? else {
            return Ok(None);
        };
        debug!(worker = %worker_id, job_id = %job.id, job_type = %job.job_type, "claimed job");

        self.update_stats(|s| s.current_running += 1);
        let outcome = self.execute(&job);
        self.update_stats(|s| s.current_running = s.current_running.saturating_sub(1));

        let disposition = self.record_or_release(worker_id, &job, outcome, backoff)?;
        self.update_stats(|s| {
            s.jobs_processed += 1;
            match disposition {
                Disposition::Succeeded => s.jobs_succeeded += 1,
                Disposition::RetryScheduled { .. } => s.jobs_retried += 1,
                Disposition::Dead { .. } => s.jobs_dead += 1,
            }
        });

        Ok(Some(ProcessedJob {
            job_id: job.id,
            disposition,
        }))
    }

    fn worker_loop(&self, worker_id: &WorkerId, config: &WorkerPoolConfig, shutdown: &Shutdown) {
        info!(worker = %worker_id, "job worker started");

        while !shutdown.is_stopped() {
            match self.run_once(worker_id, &config.backoff) {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if shutdown.idle(config.poll_interval) {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "job worker step failed");
                    if shutdown.idle(config.poll_interval) {
                        break;
                    }
                }
            }
        }

        info!(worker = %worker_id, "job worker stopped");
    }

    /// Run the handler, turning a missing handler or a panic into an outcome.
    fn execute(&self, job: &Job) -> JobOutcome {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler for job");
            return JobOutcome::permanent(format!(
                "no handler registered for job type: {}",
                job.job_type
            ));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(job))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                JobOutcome::retryable(format!("handler panicked: {}", panic_message(&*panic)))
            }
        }
    }

    /// Record `outcome`, retrying transient store failures a few times.
    ///
    /// If it still cannot be written, the claim is released so the job runs
    /// again instead of staying `claimed`, and the write error is returned.
    fn record_or_release(
        &self,
        worker_id: &WorkerId,
        job: &Job,
        outcome: JobOutcome,
        backoff: &BackoffPolicy,
    ) -> Result<Disposition, JobQueueError> {
        let mut tries = 1;
        let err = loop {
            match self.record(worker_id, job, outcome.clone(), backoff) {
                Err(JobQueueError::Store(JobStoreError::Storage(msg)))
                    if tries < OUTCOME_WRITE_ATTEMPTS =>
                {
                    warn!(
                        worker = %worker_id,
                        job_id = %job.id,
                        tries,
                        error = %msg,
                        "failed to record job outcome; retrying"
                    );
                    thread::sleep(OUTCOME_WRITE_BACKOFF * tries);
                    tries += 1;
                }
                Err(e @ JobQueueError::Store(JobStoreError::Storage(_))) => break e,
                other => return other,
            }
        };

        error!(
            worker = %worker_id,
            job_id = %job.id,
            tries,
            error = %err,
            "failed to record job outcome; releasing claim"
        );
        if let Err(release_err) = self.queue.release(job.id, worker_id) {
            error!(
                worker = %worker_id,
                job_id = %job.id,
                error = %release_err,
                "failed to release job claim; it is released when the pool restarts"
            );
        }
        Err(err)
    }

    fn record(
        &self,
        worker_id: &WorkerId,
        job: &Job,
        outcome: JobOutcome,
        backoff: &BackoffPolicy,
    ) -> Result<Disposition, JobQueueError> {
        match outcome {
            JobOutcome::Success => {
                self.queue.ack(job.id, worker_id)?;
                debug!(worker = %worker_id, job_id = %job.id, "job completed successfully");
                Ok(Disposition::Succeeded)
            }
            JobOutcome::Retryable(reason) => {
                let retry = self.queue.retry(job.id, worker_id, reason.clone(), backoff)?;
                // `attempt` here is already the incremented count.
                match retry {
                    RetryOutcome::Scheduled {
                        attempt,
                        scheduled_at,
                    } => info!(
                        worker = %worker_id,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt,
                        max_attempts = job.max_attempts,
                        scheduled_at = %scheduled_at,
                        error = %reason,
                        "job failed; retry scheduled"
                    ),
                    RetryOutcome::Exhausted { attempt } => warn!(
                        worker = %worker_id,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt,
                        max_attempts = job.max_attempts,
                        error = %reason,
                        "job failed; attempts exhausted, job is dead"
                    ),
                }
                Ok(retry.into())
            }
            JobOutcome::Permanent(reason) => {
                let dead = self.queue.fail(job.id, worker_id, reason.clone())?;
                warn!(
                    worker = %worker_id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = dead.attempt,
                    error = %reason,
                    "job failed permanently; job is dead"
                );
                Ok(Disposition::Dead {
                    attempt: dead.attempt,
                })
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerPoolStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
