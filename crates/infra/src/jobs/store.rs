//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use super::types::{EnqueueOutcome, Job, JobId, JobState, JobStatus};

/// Job store abstraction.
///
/// Duplicate policy: enqueueing an id that belongs to a live job (waiting,
/// delayed or active) writes nothing and reports [`EnqueueOutcome::Duplicate`].
/// A terminal job with the same id is replaced.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Overwrite a stored job.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Lease the next ready job of `queue` (lowest priority value first, then
    /// oldest). The returned job is already marked active.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError>;

    /// Remove a waiting or delayed job. `Ok(false)` when the id is unknown;
    /// active and terminal jobs are rejected with `InvalidState`.
    async fn remove(&self, job_id: &JobId) -> Result<bool, JobStoreError>;

    async fn set_progress(&self, job_id: &JobId, progress: f64) -> Result<(), JobStoreError>;

    /// Extend the lease of an active job. `Ok(false)` once it is no longer active.
    async fn heartbeat(&self, job_id: &JobId) -> Result<bool, JobStoreError>;

    /// Take back active jobs of `queue` whose lease ran out: no heartbeat or
    /// progress for `lease`, typically because their worker died. Each counts
    /// as a failed attempt and is retried or failed per its policy. Returns the
    /// recovered jobs as stored afterwards.
    async fn recover_expired(&self, queue: &str, lease: Duration) -> Result<Vec<Job>, JobStoreError>;

    async fn list_by_state(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {state}")]
    InvalidState { job_id: JobId, state: JobState },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn add(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Delayed => &mut self.delayed,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }
}

/// In-memory job store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let id = job.id.clone();

        let outcome = match jobs.get(&id) {
            Some(existing) if !existing.status.is_terminal() => {
                return Ok(EnqueueOutcome::Duplicate(id));
            }
            Some(_) => EnqueueOutcome::Replaced(id.clone()),
            None => EnqueueOutcome::Created(id.clone()),
        };

        jobs.insert(id, job);
        Ok(outcome)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id.clone())),
        }
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|j| j.id.clone());

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_active();
                job.clone()
            })
        }))
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(job_id) {
            None => Ok(false),
            Some(job) if job.status.is_pending() => {
                jobs.remove(job_id);
                Ok(true)
            }
            Some(job) => Err(JobStoreError::InvalidState {
                job_id: job_id.clone(),
                state: job.state(),
            }),
        }
    }

    async fn set_progress(&self, job_id: &JobId, progress: f64) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
        job.set_progress(progress);
        Ok(())
    }

    async fn heartbeat(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) if matches!(job.status, JobStatus::Active) => {
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_expired(&self, queue: &str, lease: Duration) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();

        let recovered = jobs
            .values_mut()
            .filter(|j| j.queue == queue && j.is_lease_expired(now, lease))
            .map(|job| {
                let last_seen = job.updated_at;
                job.mark_failed(lease_expired_message(lease), last_seen);
                job.clone()
            })
            .collect();
        Ok(recovered)
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && state.is_none_or(|s| j.state() == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().await;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            stats.add(job.state(), 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue).await
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        (**self).remove(job_id).await
    }

    async fn set_progress(&self, job_id: &JobId, progress: f64) -> Result<(), JobStoreError> {
        (**self).set_progress(job_id, progress).await
    }

    async fn heartbeat(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        (**self).heartbeat(job_id).await
    }

    async fn recover_expired(&self, queue: &str, lease: Duration) -> Result<Vec<Job>, JobStoreError> {
        (**self).recover_expired(queue, lease).await
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_state(queue, state, limit).await
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue).await
    }
}

pub(crate) fn lease_expired_message(lease: Duration) -> String {
    format!("worker lease expired after {}s", lease.as_secs())
}

/// Refuse to hand a terminal or active job back to a worker.
pub(crate) fn ensure_claimable(job: &Job) -> Result<(), JobStoreError> {
    if matches!(job.status, JobStatus::Waiting | JobStatus::Delayed { .. }) {
        Ok(())
    } else {
        Err(JobStoreError::InvalidState {
            job_id: job.id.clone(),
            state: job.state(),
        })
    }
}
