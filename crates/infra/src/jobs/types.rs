//! Core job types, transitions and retry policy.
//!
//! The transition methods are pure: they validate the current state, mutate
//! the in-memory `Job` and report what happened. Persisting the result is the
//! queue's job (see `JobQueue`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pressflow_core::{JobId, RunId, WorkerId};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed once `scheduled_at` has passed
    Pending,
    /// Owned by exactly one worker
    Claimed,
    /// Completed successfully
    Succeeded,
    /// Terminal failure written by another store writer; the queue never produces it
    Failed,
    /// Terminal: attempts exhausted or failed permanently
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before the next eligible attempt: `base_delay * multiplier^(attempt - 1)`,
/// capped at `max_delay`.
///
/// Deterministic in `attempt` (no jitter) and non-decreasing in `attempt`.
/// Multipliers below 1.0 are treated as 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor per further failure
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Exponential backoff without a practical cap.
    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay: Duration::MAX,
        }
    }

    /// The same delay after every failure.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Retry as soon as a worker is free.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay for a given attempt count (1-indexed; 0 means no failure yet).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        Duration::try_from_secs_f64(secs.min(max_secs)).unwrap_or(self.max_delay)
    }
}

/// What a handler reports back for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job completed successfully
    Success,
    /// Transient failure; retry with backoff until attempts run out
    Retryable(String),
    /// Non-retryable failure; the job goes straight to `dead`
    Permanent(String),
}

impl JobOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }
}

/// Result of recording a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Back to `pending`, eligible again at `scheduled_at`.
    Scheduled {
        attempt: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the job is `dead`.
    Exhausted { attempt: u32 },
}

impl RetryOutcome {
    pub fn attempt(&self) -> u32 {
        match self {
            RetryOutcome::Scheduled { attempt, .. } | RetryOutcome::Exhausted { attempt } => {
                *attempt
            }
        }
    }
}

/// A state transition that the job's current state does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {operation} a job in status {status}")]
    InvalidStatus {
        status: JobStatus,
        operation: &'static str,
    },
    #[error("job is not claimed by worker {caller}")]
    NotClaimedBy {
        caller: WorkerId,
        holder: Option<WorkerId>,
    },
    #[error("job has used {attempt} of {max_attempts} attempts")]
    AttemptsExhausted { attempt: u32, max_attempts: u32 },
}

/// A queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Handler discriminator
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque handler input
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Executions that have failed so far (starts at 0)
    pub attempt: u32,
    /// Total executions allowed; fixed at enqueue
    pub max_attempts: u32,
    /// Execution run this job reports to, if any
    pub run_id: Option<RunId>,
    /// Worker holding the claim while `claimed`
    pub claimed_by: Option<WorkerId>,
    /// Reason recorded by the most recent failure
    pub last_error: Option<String>,
    /// Not claimable before this instant
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh `pending` job with `attempt = 0`, claimable from `now`.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            attempt: 0,
            max_attempts,
            run_id: None,
            claimed_by: None,
            last_error: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Pending and due.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    pub(crate) fn mark_claimed(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(worker_id.clone());
        self.updated_at = now;
    }

    fn ensure_claimed_by(
        &self,
        worker_id: &WorkerId,
        operation: &'static str,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Claimed {
            return Err(TransitionError::InvalidStatus {
                status: self.status,
                operation,
            });
        }
        if self.claimed_by.as_ref() != Some(worker_id) {
            return Err(TransitionError::NotClaimedBy {
                caller: worker_id.clone(),
                holder: self.claimed_by.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn mark_succeeded(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_claimed_by(worker_id, "ack")?;
        self.status = JobStatus::Succeeded;
        self.claimed_by = None;
        self.updated_at = now;
        Ok(())
    }

    /// Count one failed attempt and either reschedule or kill the job.
    ///
    /// The exhaustion check uses the post-increment count: with
    /// `max_attempts = m`, the m-th recorded failure is the one that kills.
    pub(crate) fn record_failure(
        &mut self,
        worker_id: &WorkerId,
        reason: String,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, TransitionError> {
        self.ensure_claimed_by(worker_id, "retry")?;

        self.attempt = self.attempt.saturating_add(1).min(self.max_attempts);
        self.claimed_by = None;
        self.last_error = Some(reason);
        self.updated_at = now;

        if self.attempt >= self.max_attempts {
            self.status = JobStatus::Dead;
            return Ok(RetryOutcome::Exhausted {
                attempt: self.attempt,
            });
        }

        self.status = JobStatus::Pending;
        self.scheduled_at = after(now, policy.delay_for_attempt(self.attempt));
        Ok(RetryOutcome::Scheduled {
            attempt: self.attempt,
            scheduled_at: self.scheduled_at,
        })
    }

    /// Count the failed attempt and go straight to `dead`.
    pub(crate) fn mark_dead(
        &mut self,
        worker_id: &WorkerId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_claimed_by(worker_id, "fail")?;
        self.attempt = self.attempt.saturating_add(1).min(self.max_attempts);
        self.status = JobStatus::Dead;
        self.claimed_by = None;
        self.last_error = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Hand a claimed job back to `pending` without counting an attempt.
    ///
    /// Used when the claimant could not record an outcome, so the job is
    /// due again immediately instead of staying `claimed` forever.
    pub(crate) fn release_claim(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_claimed_by(worker_id, "release")?;
        self.status = JobStatus::Pending;
        self.claimed_by = None;
        self.scheduled_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Put an existing job back to `pending`, carrying `attempt` forward.
    ///
    /// `stored_attempt` is the count currently persisted for this id, if any;
    /// the larger of the two counts wins so a stale copy can never reset it.
    pub(crate) fn reset_for_requeue(
        &mut self,
        stored_attempt: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status == JobStatus::Claimed {
            return Err(TransitionError::InvalidStatus {
                status: self.status,
                operation: "requeue",
            });
        }

        let attempt = self.attempt.max(stored_attempt.unwrap_or(0));
        if attempt >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                attempt,
                max_attempts: self.max_attempts,
            });
        }

        self.attempt = attempt;
        self.status = JobStatus::Pending;
        self.claimed_by = None;
        self.scheduled_at = now;
        self.updated_at = now;
        Ok(())
    }
}

/// `now + delay`, saturating at the far future instead of overflowing.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
