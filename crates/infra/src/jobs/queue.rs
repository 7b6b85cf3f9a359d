//! The job queue: enqueue/claim/ack/retry/fail on top of a `JobRepository`.
//!
//! Every mutation is read → pure transition on `Job` → conditional write
//! guarded by the status/claimant that was read. Two callers racing on the
//! same job therefore cannot both win: the loser gets `Conflict`.

use chrono::Utc;
use tracing::{debug, info, instrument};

use pressflow_core::CoreError;

use super::store::{JobRepository, JobStats, JobStoreError, StatusGuard};
use super::types::{
    BackoffPolicy, Job, JobId, JobStatus, RetryOutcome, RunId, TransitionError, WorkerId,
};

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id}: {source}")]
    Transition {
        job_id: JobId,
        #[source]
        source: TransitionError,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl JobQueueError {
    fn transition(job_id: JobId) -> impl FnOnce(TransitionError) -> Self {
        move |source| Self::Transition { job_id, source }
    }
}

/// Single source of truth for job existence and state transitions.
#[derive(Debug, Clone)]
pub struct JobQueue<R: JobRepository> {
    repo: R,
}

impl<R: JobRepository> JobQueue<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Create a new `pending` job with `attempt = 0`.
    ///
    /// Never looks at other jobs, of the same type or otherwise.
    pub fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<Job, JobQueueError> {
        let job = Job::new(job_type, payload, max_attempts, Utc::now());
        self.insert_new(job)
    }

    /// Like [`enqueue`](Self::enqueue), for a job that reports to `run_id`.
    pub fn enqueue_for_run(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        run_id: RunId,
    ) -> Result<Job, JobQueueError> {
        let job = Job::new(job_type, payload, max_attempts, Utc::now()).for_run(run_id);
        self.insert_new(job)
    }

    fn insert_new(&self, job: Job) -> Result<Job, JobQueueError> {
        validate(&job)?;
        self.repo.insert_job(&job)?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            max_attempts = job.max_attempts,
            "job enqueued"
        );
        Ok(job)
    }

    /// Re-enqueue an existing job object, preserving its attempt count.
    ///
    /// The count carried forward is the larger of `job.attempt` and the
    /// stored row's. Claimed jobs and jobs with no attempts left are refused.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub fn requeue(&self, mut job: Job) -> Result<Job, JobQueueError> {
        validate(&job)?;
        let stored = self.repo.get_job(job.id)?;

        if let Some(stored) = &stored {
            // The stored row decides whether a worker currently owns the job.
            job.status = stored.status;
            job.claimed_by = stored.claimed_by.clone();
            job.created_at = stored.created_at;
        }

        job.reset_for_requeue(stored.as_ref().map(|s| s.attempt), Utc::now())
            .map_err(JobQueueError::transition(job.id))?;

        match &stored {
            Some(stored) => self.repo.update_job_status(&job, &StatusGuard::of(stored))?,
            None => self.repo.insert_job(&job)?,
        }

        debug!(job_id = %job.id, attempt = job.attempt, "job requeued");
        Ok(job)
    }

    /// Take ownership of the oldest due `pending` job, if any.
    pub fn claim(&self, worker_id: &WorkerId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.repo.select_claimable_job(worker_id, Utc::now())?)
    }

    /// Mark a job claimed by `worker_id` as `succeeded`.
    pub fn ack(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Job, JobQueueError> {
        self.transition(job_id, |job| job.mark_succeeded(worker_id, Utc::now()))
    }

    /// Record a retryable failure of a job claimed by `worker_id`.
    ///
    /// Increments `attempt`; when the new count reaches `max_attempts` the job
    /// is `dead` and `Exhausted` is returned, otherwise it is `pending` again
    /// at `now + policy.delay_for_attempt(attempt)`.
    pub fn retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: impl Into<String>,
        policy: &BackoffPolicy,
    ) -> Result<RetryOutcome, JobQueueError> {
        let reason = reason.into();
        let mut outcome = None;
        self.transition(job_id, |job| {
            outcome = Some(job.record_failure(worker_id, reason, policy, Utc::now())?);
            Ok(())
        })?;
        outcome.ok_or(JobQueueError::NotFound(job_id))
    }

    /// Record a non-retryable failure: the job goes straight to `dead`.
    pub fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        reason: impl Into<String>,
    ) -> Result<Job, JobQueueError> {
        let reason = reason.into();
        self.transition(job_id, |job| job.mark_dead(worker_id, reason, Utc::now()))
    }

    /// Hand a job claimed by `worker_id` back to `pending`, due now.
    ///
    /// The attempt count is left alone: releasing is not a failure.
    pub fn release(&self, job_id: JobId, worker_id: &WorkerId) -> Result<Job, JobQueueError> {
        self.transition(job_id, |job| job.release_claim(worker_id, Utc::now()))
    }

    /// Release every job still claimed by one of `worker_ids`.
    ///
    /// Only call this for workers that are known not to be running. Jobs that
    /// change hands concurrently are skipped. Returns the released ids.
    #[instrument(skip(self, worker_ids), fields(workers = worker_ids.len()), err)]
    pub fn release_claims(&self, worker_ids: &[WorkerId]) -> Result<Vec<JobId>, JobQueueError> {
        let orphaned = self
            .repo
            .list_jobs(Some(JobStatus::Claimed), usize::MAX)?
            .into_iter()
            .filter(|job| {
                job.claimed_by
                    .as_ref()
                    .is_some_and(|holder| worker_ids.contains(holder))
            });

        let mut released = Vec::new();
        for job in orphaned {
            let Some(holder) = job.claimed_by.as_ref() else {
                continue;
            };
            match self.release(job.id, holder) {
                Ok(_) => released.push(job.id),
                Err(JobQueueError::Store(JobStoreError::Conflict(_)))
                | Err(JobQueueError::Transition { .. }) => {
                    debug!(job_id = %job.id, "claim changed before release; skipped");
                }
                Err(e) => return Err(e),
            }
        }

        if !released.is_empty() {
            info!(count = released.len(), "released orphaned job claims");
        }
        Ok(released)
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, JobQueueError> {
        self.repo
            .get_job(job_id)?
            .ok_or(JobQueueError::NotFound(job_id))
    }

    /// Jobs, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobQueueError> {
        Ok(self.repo.list_jobs(status, limit)?)
    }

    pub fn stats(&self) -> Result<JobStats, JobQueueError> {
        Ok(self.repo.stats()?)
    }

    fn transition<F>(&self, job_id: JobId, apply: F) -> Result<Job, JobQueueError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError>,
    {
        let mut job = self.get(job_id)?;
        let guard = StatusGuard::of(&job);
        apply(&mut job).map_err(JobQueueError::transition(job_id))?;
        self.repo.update_job_status(&job, &guard)?;
        Ok(job)
    }
}

fn validate(job: &Job) -> Result<(), CoreError> {
    if job.job_type.trim().is_empty() {
        return Err(CoreError::validation("job type must not be empty"));
    }
    if job.max_attempts == 0 {
        return Err(CoreError::validation("max_attempts must be at least 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobRepository;
    use std::time::Duration;

    fn queue() -> JobQueue<InMemoryJobRepository> {
        JobQueue::new(InMemoryJobRepository::new())
    }

    fn worker(id: &str) -> WorkerId {
        WorkerId::new(id).unwrap()
    }

    /// Claim `job_id` (must be the only due job) and record one failure.
    fn claim_and_retry(q: &JobQueue<InMemoryJobRepository>, job_id: JobId) -> RetryOutcome {
        let w = worker("w-1");
        let claimed = q.claim(&w).unwrap().expect("job should be claimable");
        assert_eq!(claimed.id, job_id);
        q.retry(job_id, &w, "transient", &BackoffPolicy::immediate()).unwrap()
    }

    #[test]
    fn enqueue_creates_pending_job_with_zero_attempts() {
        let q = queue();
        let job = q.enqueue("outreach.send", serde_json::json!({"to": "desk"}), 3).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(q.get(job.id).unwrap(), job);
    }

    #[test]
    fn enqueue_never_inherits_attempts_from_same_typed_jobs() {
        let q = queue();
        let first = q.enqueue("outreach.send", serde_json::json!({}), 3).unwrap();
        claim_and_retry(&q, first.id);
        assert_eq!(q.get(first.id).unwrap().attempt, 1);

        let second = q.enqueue("outreach.send", serde_json::json!({}), 3).unwrap();
        assert_eq!(second.attempt, 0);
    }

    #[test]
    fn enqueue_validates_input() {
        let q = queue();
        assert!(matches!(
            q.enqueue("t", serde_json::json!({}), 0),
            Err(JobQueueError::Invalid(CoreError::Validation(_)))
        ));
        assert!(matches!(
            q.enqueue("  ", serde_json::json!({}), 1),
            Err(JobQueueError::Invalid(_))
        ));
        assert_eq!(q.stats().unwrap().total(), 0);
    }

    #[test]
    fn max_attempts_two_scenario() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 2).unwrap();

        let first = claim_and_retry(&q, job.id);
        assert!(matches!(first, RetryOutcome::Scheduled { attempt: 1, .. }));
        let stored = q.get(job.id).unwrap();
        assert_eq!((stored.status, stored.attempt), (JobStatus::Pending, 1));

        let second = claim_and_retry(&q, job.id);
        assert_eq!(second, RetryOutcome::Exhausted { attempt: 2 });
        let stored = q.get(job.id).unwrap();
        assert_eq!((stored.status, stored.attempt), (JobStatus::Dead, 2));

        // A third retry is rejected and does not resurrect the job.
        let err = q
            .retry(job.id, &worker("w-1"), "again", &BackoffPolicy::immediate())
            .unwrap_err();
        assert!(matches!(
            err,
            JobQueueError::Transition {
                source: TransitionError::InvalidStatus {
                    status: JobStatus::Dead,
                    ..
                },
                ..
            }
        ));
        let stored = q.get(job.id).unwrap();
        assert_eq!((stored.status, stored.attempt), (JobStatus::Dead, 2));
        assert!(q.claim(&worker("w-1")).unwrap().is_none());
    }

    #[test]
    fn job_dies_exactly_on_the_mth_retry() {
        for m in [1u32, 2, 5] {
            let q = queue();
            let job = q.enqueue("t", serde_json::json!({}), m).unwrap();

            for n in 1..m {
                let outcome = claim_and_retry(&q, job.id);
                assert_eq!(outcome.attempt(), n, "m = {m}");
                assert!(matches!(outcome, RetryOutcome::Scheduled { .. }), "m = {m}");
            }

            assert_eq!(claim_and_retry(&q, job.id), RetryOutcome::Exhausted { attempt: m });
            assert_eq!(q.get(job.id).unwrap().status, JobStatus::Dead);
        }
    }

    #[test]
    fn retry_backoff_delays_next_claim() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        let w = worker("w-1");
        q.claim(&w).unwrap().unwrap();

        let outcome = q
            .retry(job.id, &w, "rate limited", &BackoffPolicy::fixed(Duration::from_secs(60)))
            .unwrap();

        match outcome {
            RetryOutcome::Scheduled { scheduled_at, .. } => assert!(scheduled_at > Utc::now()),
            other => panic!("expected a scheduled retry, got {other:?}"),
        }
        assert!(q.claim(&w).unwrap().is_none());
        assert_eq!(q.get(job.id).unwrap().last_error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn ack_by_claimant_succeeds() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        let w = worker("w-1");
        q.claim(&w).unwrap().unwrap();

        let acked = q.ack(job.id, &w).unwrap();
        assert_eq!(acked.status, JobStatus::Succeeded);
        assert!(acked.claimed_by.is_none());
        assert_eq!(q.get(job.id).unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn ack_by_another_worker_is_rejected() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        q.claim(&worker("w-1")).unwrap().unwrap();

        let err = q.ack(job.id, &worker("w-2")).unwrap_err();
        assert!(matches!(
            err,
            JobQueueError::Transition {
                source: TransitionError::NotClaimedBy { .. },
                ..
            }
        ));
        assert_eq!(q.get(job.id).unwrap().status, JobStatus::Claimed);
    }

    #[test]
    fn ack_of_unclaimed_or_unknown_job_fails() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        assert!(matches!(q.ack(job.id, &worker("w-1")), Err(JobQueueError::Transition { .. })));
        assert!(matches!(
            q.ack(JobId::new(), &worker("w-1")),
            Err(JobQueueError::NotFound(_))
        ));
    }

    #[test]
    fn fail_goes_straight_to_dead() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 5).unwrap();
        let w = worker("w-1");
        q.claim(&w).unwrap().unwrap();

        let dead = q.fail(job.id, &w, "payload rejected").unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempt, 1);
        assert_eq!(dead.last_error.as_deref(), Some("payload rejected"));
    }

    #[test]
    fn requeue_preserves_attempt_count() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 5).unwrap();
        claim_and_retry(&q, job.id);
        claim_and_retry(&q, job.id);

        // Even a stale copy with attempt = 0 must not reset the count.
        let mut stale = job.clone();
        stale.attempt = 0;
        let requeued = q.requeue(stale).unwrap();
        assert_eq!(requeued.attempt, 2);
        assert_eq!(q.get(job.id).unwrap().attempt, 2);
        assert_eq!(q.get(job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn requeue_of_permanently_failed_job_with_attempts_left() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        let w = worker("w-1");
        q.claim(&w).unwrap().unwrap();
        let dead = q.fail(job.id, &w, "bad input").unwrap();

        let requeued = q.requeue(dead).unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempt, 1);
        assert_eq!(q.claim(&w).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn requeue_refuses_exhausted_and_claimed_jobs() {
        let q = queue();
        let exhausted = q.enqueue("t", serde_json::json!({}), 1).unwrap();
        claim_and_retry(&q, exhausted.id);
        let dead = q.get(exhausted.id).unwrap();
        assert!(matches!(
            q.requeue(dead),
            Err(JobQueueError::Transition {
                source: TransitionError::AttemptsExhausted { .. },
                ..
            })
        ));

        let busy = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        q.claim(&worker("w-1")).unwrap().unwrap();
        // The caller's copy still says pending; the stored claim wins.
        assert!(matches!(
            q.requeue(busy),
            Err(JobQueueError::Transition {
                source: TransitionError::InvalidStatus {
                    status: JobStatus::Claimed,
                    ..
                },
                ..
            })
        ));
    }

    #[test]
    fn requeue_of_unknown_job_inserts_it() {
        let q = queue();
        let mut job = Job::new("import", serde_json::json!({}), 4, Utc::now());
        job.attempt = 2;
        job.status = JobStatus::Dead;

        let requeued = q.requeue(job.clone()).unwrap();
        assert_eq!(requeued.attempt, 2);
        assert_eq!(q.get(job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn release_returns_claim_without_counting_an_attempt() {
        let q = queue();
        let job = q.enqueue("t", serde_json::json!({}), 3).unwrap();
        let w = worker("w-1");
        q.claim(&w).unwrap().unwrap();

        assert!(matches!(
            q.release(job.id, &worker("w-2")),
            Err(JobQueueError::Transition {
                source: TransitionError::NotClaimedBy { .. },
                ..
            })
        ));

        let released = q.release(job.id, &w).unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.attempt, 0);
        assert!(released.claimed_by.is_none());
        assert_eq!(q.claim(&worker("w-2")).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn release_claims_only_touches_the_named_workers() {
        let q = queue();
        let (a, b, other) = (worker("pool-0"), worker("pool-1"), worker("elsewhere-0"));
        let ids: Vec<_> = (0..4)
            .map(|_| q.enqueue("t", serde_json::json!({}), 3).unwrap().id)
            .collect();
        for w in [&a, &b, &other] {
            q.claim(w).unwrap().unwrap();
        }

        let released = q.release_claims(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(released, ids[..2].to_vec());

        let still_claimed = q.list(Some(JobStatus::Claimed), 10).unwrap();
        assert_eq!(still_claimed.len(), 1);
        assert_eq!(still_claimed[0].claimed_by, Some(other));
        assert_eq!(q.stats().unwrap().pending, 3);

        // Nothing left to release the second time round.
        assert!(q.release_claims(&[a, b]).unwrap().is_empty());
    }

    #[test]
    fn list_and_stats_expose_dead_jobs() {
        let q = queue();
        let doomed = q.enqueue("t", serde_json::json!({}), 1).unwrap();
        claim_and_retry(&q, doomed.id);
        q.enqueue("t", serde_json::json!({}), 1).unwrap();

        let dead = q.list(Some(JobStatus::Dead), 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, doomed.id);

        let stats = q.stats().unwrap();
        assert_eq!((stats.dead, stats.pending), (1, 1));
    }

    #[test]
    fn enqueue_for_run_records_run_id() {
        let q = queue();
        let run = RunId::new("run-7").unwrap();
        let job = q.enqueue_for_run("t", serde_json::json!({}), 1, run.clone()).unwrap();
        assert_eq!(q.get(job.id).unwrap().run_id, Some(run));
    }
}
