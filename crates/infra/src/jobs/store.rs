//! Job persistence: the narrow repository interface the queue depends on,
//! and an in-memory implementation for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::types::{Job, JobId, JobStatus, WorkerId};

/// Expected state of a row for a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusGuard {
    pub status: JobStatus,
    pub claimed_by: Option<WorkerId>,
}

impl StatusGuard {
    /// Expect the row to still look like `job` does now.
    pub fn of(job: &Job) -> Self {
        Self {
            status: job.status,
            claimed_by: job.claimed_by.clone(),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.status && job.claimed_by == self.claimed_by
    }
}

/// Durable job table, as seen by the queue.
pub trait JobRepository: Send + Sync {
    /// Insert a new row. Fails with `AlreadyExists` if the id is taken.
    fn insert_job(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically pick the oldest `pending` job with `scheduled_at <= now`,
    /// mark it `claimed` by `worker_id` and return it.
    ///
    /// Implementations must guarantee that concurrent callers never receive
    /// the same job.
    fn select_claimable_job(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Persist the mutable fields of `job` (status, attempt, claimant, last
    /// error, schedule, updated_at) if the stored row still matches `expected`.
    ///
    /// Returns `Conflict` when the row changed underneath the caller.
    fn update_job_status(&self, job: &Job, expected: &StatusGuard) -> Result<(), JobStoreError>;

    /// List jobs, oldest first.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} was modified concurrently")]
    Conflict(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Claimed => self.claimed += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Dead => self.dead += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.succeeded + self.failed + self.dead
    }
}

/// In-memory job store for tests/dev.
///
/// Every operation runs inside one mutex-protected critical section, which is
/// what makes `select_claimable_job` linearizable.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    table: Mutex<Table>,
}

/// Rows plus an index of the `pending` ones in claim order.
///
/// `pending` holds `(created_at, id)` for exactly the rows whose status is
/// `Pending`, so claiming never walks finished jobs.
#[derive(Debug, Default)]
struct Table {
    jobs: HashMap<JobId, Job>,
    pending: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl Table {
    fn index(&mut self, job: &Job) {
        if job.status == JobStatus::Pending {
            self.pending.insert((job.created_at, job.id));
        }
    }

    fn unindex(&mut self, job: &Job) {
        if job.status == JobStatus::Pending {
            self.pending.remove(&(job.created_at, job.id));
        }
    }

    /// Oldest pending row that is due; ids break ties between jobs created
    /// in the same instant.
    fn next_due(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.pending
            .iter()
            .map(|(_, id)| *id)
            .find(|id| self.jobs.get(id).is_some_and(|j| j.is_claimable(now)))
    }
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn table(&self) -> Result<MutexGuard<'_, Table>, JobStoreError> {
        self.table
            .lock()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn insert_job(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut table = self.table()?;
        if table.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        table.index(job);
        table.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.table()?.jobs.get(&job_id).cloned())
    }

    fn select_claimable_job(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut table = self.table()?;
        let Some(id) = table.next_due(now) else {
            return Ok(None);
        };

        let Some(job) = table.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_claimed(worker_id, now);
        let claimed = job.clone();
        table.pending.remove(&(claimed.created_at, claimed.id));
        Ok(Some(claimed))
    }

    fn update_job_status(&self, job: &Job, expected: &StatusGuard) -> Result<(), JobStoreError> {
        let mut table = self.table()?;
        let stored = table.jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if !expected.matches(stored) {
            return Err(JobStoreError::Conflict(job.id));
        }
        let previous = stored.clone();
        table.unindex(&previous);

        let Some(stored) = table.jobs.get_mut(&job.id) else {
            return Err(JobStoreError::NotFound(job.id));
        };
        stored.status = job.status;
        stored.attempt = job.attempt;
        stored.claimed_by = job.claimed_by.clone();
        stored.last_error = job.last_error.clone();
        stored.scheduled_at = job.scheduled_at;
        stored.updated_at = job.updated_at;
        let updated = stored.clone();
        table.index(&updated);
        Ok(())
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let table = self.table()?;
        let mut result: Vec<_> = table
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let table = self.table()?;
        let mut stats = JobStats::default();
        for job in table.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

impl<R: JobRepository + ?Sized> JobRepository for Arc<R> {
    fn insert_job(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).insert_job(job)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(job_id)
    }

    fn select_claimable_job(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).select_claimable_job(worker_id, now)
    }

    fn update_job_status(&self, job: &Job, expected: &StatusGuard) -> Result<(), JobStoreError> {
        (**self).update_job_status(job, expected)
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_jobs(status, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
