//! Producer-side facade over a [`JobStore`].

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{EnqueueOutcome, Job, JobId, JobOptions, JobState};

/// Job queue shared by producers (API) and consumers (executors).
///
/// Executors created from the same `JobQueue` are woken on enqueue; executors
/// in other processes fall back to their poll interval.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let job = Job::from_options(queue, name, payload, options);
        let outcome = self.store.enqueue(job).await?;

        match &outcome {
            EnqueueOutcome::Duplicate(id) => {
                debug!(job_id = %id, queue, name, "job already queued, enqueue ignored");
            }
            EnqueueOutcome::Created(id) | EnqueueOutcome::Replaced(id) => {
                info!(job_id = %id, queue, name, "enqueued job");
                self.notify.notify_one();
            }
        }

        Ok(outcome)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn get_state(&self, job_id: &JobId) -> Result<Option<JobState>, JobStoreError> {
        Ok(self.store.get(job_id).await?.map(|job| job.state()))
    }

    /// Remove a job that has not started yet.
    pub async fn remove(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        self.store.remove(job_id).await
    }

    pub async fn update_progress(&self, job_id: &JobId, progress: f64) -> Result<(), JobStoreError> {
        self.store.set_progress(job_id, progress).await
    }

    pub async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        self.store.stats(queue).await
    }
}
