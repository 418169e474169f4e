//! Run lifecycle of an analysis.
//!
//! The orchestrator owns every write to the Progress Store and every
//! pipeline-driven write to the system of record. Cache failures degrade the
//! experience (stale progress, no live events) but never fail a run; the
//! system of record is authoritative.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use canopy_analysis::{
    ANALYSIS_QUEUE, AnalysisStatus, CallbackPayload, FULL_PIPELINE_JOB, InputFile, ProgressEvent,
    ProgressRecord, ProgressUpdate, PipelineJobPayload, ResultsRecord, Stage, pipeline_job_id,
};
use canopy_core::{AnalysisId, UserId};

use crate::jobs::{JobId, JobOptions, JobQueue, JobStoreError, RetryPolicy};
use crate::records::{AnalysisRecord, Completion, persisted_percent};

use super::{CallbackOutcome, PipelineDeps, PipelineError, ProgressOutcome, PipelineSettings};

pub const QUEUED_MESSAGE: &str = "Analysis queued";
pub const COMPLETED_MESSAGE: &str = "Analysis completed";
pub const CANCELLED_MESSAGE: &str = "Analysis cancelled by user";

/// Pipeline jobs jump ahead of default-priority work.
const PIPELINE_PRIORITY: i32 = 1;

pub struct PipelineOrchestrator {
    deps: PipelineDeps,
    /// Serialises read-modify-write of one analysis' progress.
    locks: LockMap,
    /// Runs executing in this process, fired on cancel.
    running: Mutex<HashMap<AnalysisId, CancellationToken>>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("settings", &self.deps.settings)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type LockMap = Mutex<HashMap<AnalysisId, Arc<AsyncMutex<()>>>>;

/// Exclusive access to one analysis. The map entry is dropped with the last holder.
struct AnalysisGuard<'a> {
    locks: &'a LockMap,
    id: AnalysisId,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AnalysisGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(self.locks);
        // One reference in the map, one here: nobody else holds or waits.
        let idle = locks
            .get(&self.id)
            .is_some_and(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2);
        if idle {
            locks.remove(&self.id);
        }
    }
}

impl PipelineOrchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps,
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.deps.settings
    }

    pub fn queue(&self) -> &JobQueue {
        &self.deps.queue
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    fn retry_policy(&self) -> RetryPolicy {
        let jobs = &self.deps.settings.jobs;
        RetryPolicy::exponential(
            jobs.attempts.max(1),
            jobs.backoff,
            jobs.backoff.saturating_mul(16),
        )
    }

    async fn lock_analysis(&self, id: AnalysisId) -> AnalysisGuard<'_> {
        let mutex = lock(&self.locks).entry(id).or_default().clone();
        let guard = mutex.clone().lock_owned().await;
        AnalysisGuard {
            locks: &self.locks,
            id,
            mutex,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        lock(&self.locks).len()
    }

    /// Register a run executing in this process. The token fires on cancel.
    pub fn register_run(&self, id: AnalysisId) -> CancellationToken {
        let token = CancellationToken::new();
        lock(&self.running).insert(id, token.clone());
        token
    }

    pub fn finish_run(&self, id: AnalysisId) {
        lock(&self.running).remove(&id);
    }

    /// Start (or restart) a run and enqueue its pipeline job.
    #[instrument(skip(self, files, parameters), fields(analysis_id = %id), err)]
    pub async fn start_pipeline(
        &self,
        id: AnalysisId,
        files: Vec<InputFile>,
        parameters: JsonValue,
        user_id: UserId,
    ) -> Result<JobId, PipelineError> {
        let record = self
            .deps
            .repository
            .get(id)
            .await?
            .ok_or(PipelineError::EntityNotFound(id))?;
        let job_id = JobId::new(pipeline_job_id(id));

        if record.status == AnalysisStatus::Completed {
            return Err(PipelineError::InvalidState(format!(
                "analysis {id} is already completed"
            )));
        }

        let live_job = self
            .deps
            .queue
            .get_job(&job_id)
            .await?
            .filter(|job| !job.status.is_terminal());
        match (record.status, live_job) {
            (AnalysisStatus::Processing, Some(job)) => {
                debug!(job_id = %job_id, state = %job.state(), "run already in flight");
                return Ok(job_id);
            }
            (AnalysisStatus::Processing, None) => {
                warn!("analysis marked processing without a live job, restarting");
            }
            // The old job still owns the id; enqueueing now would collapse into it.
            (status, Some(job)) => {
                return Err(PipelineError::InvalidState(format!(
                    "previous run of analysis {id} is still stopping (status {status}, job {})",
                    job.state()
                )));
            }
            (_, None) => {}
        }

        let now = Utc::now();
        if let Err(e) = self.deps.progress.clear_cancel_flag(id).await {
            warn!(error = %e, "failed to clear cancellation flag");
        }

        let progress = ProgressRecord::queued(id, now);
        self.cache_progress(&progress).await;
        self.deps
            .repository
            .mark_processing(id, QUEUED_MESSAGE, now)
            .await?;

        let payload = PipelineJobPayload::new(id, files, record.project_id, user_id, parameters);
        let payload = serde_json::to_value(&payload)
            .map_err(|e| PipelineError::InvalidState(format!("unserialisable job payload: {e}")))?;
        let options = JobOptions::default()
            .with_job_id(job_id.clone())
            .with_priority(PIPELINE_PRIORITY)
            .with_retry_policy(self.retry_policy());

        let outcome = self
            .deps
            .queue
            .enqueue(ANALYSIS_QUEUE, FULL_PIPELINE_JOB, payload, options)
            .await?;
        self.publish(ProgressEvent::progress(&progress)).await;

        info!(job_id = %outcome.job_id(), "analysis pipeline started");
        Ok(outcome.into_job_id())
    }

    /// Apply a progress report from the processing service.
    ///
    /// Reports that would move the run backwards are ignored, not errors.
    #[instrument(skip(self, update), fields(analysis_id = %id, stage = %update.stage, stage_progress = update.stage_progress))]
    pub async fn update_progress(
        &self,
        id: AnalysisId,
        update: ProgressUpdate,
    ) -> Result<ProgressOutcome, PipelineError> {
        let _guard = self.lock_analysis(id).await;

        let mut record = self.load_progress(id).await?;
        let now = Utc::now();
        let transition = match record.apply(update, now) {
            Ok(t) => t,
            Err(rejected) => {
                info!(reason = %rejected, "progress update ignored");
                return Ok(ProgressOutcome::Ignored(rejected));
            }
        };

        self.cache_progress(&record).await;
        if transition.should_persist() {
            self.deps
                .repository
                .update_progress(id, persisted_percent(record.progress), &record.message)
                .await?;
        }
        self.sync_job_progress(id, record.progress).await;
        self.publish(ProgressEvent::progress(&record)).await;

        debug!(progress = record.progress, "progress updated");
        Ok(ProgressOutcome::Applied(transition))
    }

    /// Record final results and mark the run completed.
    #[instrument(skip(self, results), fields(analysis_id = %id), err)]
    pub async fn complete_processing(
        &self,
        id: AnalysisId,
        results: JsonValue,
    ) -> Result<ResultsRecord, PipelineError> {
        let _guard = self.lock_analysis(id).await;

        if self.is_cancelled(id).await {
            return Err(PipelineError::CancelledByUser(id));
        }

        let mut record = self.load_progress(id).await?;
        let now = Utc::now();
        let processing_time = record.elapsed_secs(now);
        let results = ResultsRecord::new(results, processing_time);
        record.complete(COMPLETED_MESSAGE, now);

        self.cache_progress(&record).await;
        if let Err(e) = self
            .deps
            .progress
            .set_results(id, &results, self.deps.settings.ttl.results)
            .await
        {
            warn!(error = %e, "failed to cache results");
        }

        self.deps
            .repository
            .complete(
                id,
                Completion {
                    results: results.clone().into_json(),
                    statistics: results.statistics(),
                    processing_time_secs: processing_time,
                    completed_at: now,
                },
            )
            .await?;
        self.sync_job_progress(id, 100.0).await;
        self.publish(ProgressEvent::complete(&record, results.clone().into_json()))
            .await;
        drop(_guard);
        self.finish_run(id);

        info!(processing_time, "analysis completed");
        Ok(results)
    }

    /// Mark the run failed. Safe to call more than once; never fails.
    #[instrument(skip(self), fields(analysis_id = %id))]
    pub async fn fail_processing(&self, id: AnalysisId, error: &str) {
        let _guard = self.lock_analysis(id).await;

        match self.deps.repository.get(id).await {
            Ok(Some(stored)) if matches!(stored.status, AnalysisStatus::Completed | AnalysisStatus::Cancelled) => {
                info!(status = %stored.status, "run already finished, failure not recorded");
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read analysis before failing it"),
        }

        let now = Utc::now();
        let mut record = match self.load_progress(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "no progress state, failing from a fresh record");
                ProgressRecord::queued(id, now)
            }
        };
        record.fail(error, now);

        self.cache_progress(&record).await;
        if let Err(e) = self.deps.repository.fail(id, error).await {
            warn!(error = %e, "failed to persist analysis failure");
        }
        self.publish(ProgressEvent::error(&record, error)).await;
        drop(_guard);
        self.finish_run(id);

        warn!(error, "analysis failed");
    }

    /// Cancel a run: flag it, stop it locally, dequeue it if it has not started.
    #[instrument(skip(self), fields(analysis_id = %id), err)]
    pub async fn cancel_processing(&self, id: AnalysisId) -> Result<bool, PipelineError> {
        let stored = self
            .deps
            .repository
            .get(id)
            .await?
            .ok_or(PipelineError::EntityNotFound(id))?;
        if stored.status == AnalysisStatus::Completed {
            return Err(PipelineError::InvalidState(format!(
                "analysis {id} is already completed"
            )));
        }

        let _guard = self.lock_analysis(id).await;

        // Other processes only learn about the cancel through the flag.
        self.deps
            .progress
            .set_cancel_flag(id, self.deps.settings.ttl.cancel)
            .await?;

        if let Some(token) = lock(&self.running).get(&id) {
            token.cancel();
        }

        let job_id = JobId::new(pipeline_job_id(id));
        match self.deps.queue.remove(&job_id).await {
            Ok(true) => debug!(job_id = %job_id, "removed pending job"),
            Ok(false) => {}
            Err(JobStoreError::InvalidState { state, .. }) => {
                debug!(job_id = %job_id, %state, "job already running, left to observe the flag");
            }
            Err(e) => return Err(e.into()),
        }

        self.deps.repository.cancel(id, CANCELLED_MESSAGE).await?;

        let now = Utc::now();
        let mut record = self
            .load_progress(id)
            .await
            .unwrap_or_else(|_| ProgressRecord::queued(id, now));
        record.fail(CANCELLED_MESSAGE, now);
        self.cache_progress(&record).await;
        self.publish(ProgressEvent::error(&record, "Cancelled by user"))
            .await;
        drop(_guard);
        self.finish_run(id);

        info!("analysis cancelled");
        Ok(true)
    }

    /// Cancellation flag, falling back to the persisted status when the cache is down.
    pub async fn is_cancelled(&self, id: AnalysisId) -> bool {
        match self.deps.progress.is_cancelled(id).await {
            Ok(flag) => flag,
            Err(e) => {
                warn!(analysis_id = %id, error = %e, "cancel flag unreadable, using stored status");
                matches!(
                    self.deps.repository.get(id).await,
                    Ok(Some(AnalysisRecord {
                        status: AnalysisStatus::Cancelled,
                        ..
                    }))
                )
            }
        }
    }

    /// Latest progress: the cached record, else a snapshot of the system of record.
    pub async fn get_progress(&self, id: AnalysisId) -> Result<ProgressRecord, PipelineError> {
        self.load_progress(id).await
    }

    /// Final results, if the run completed.
    pub async fn get_results(&self, id: AnalysisId) -> Result<Option<ResultsRecord>, PipelineError> {
        match self.deps.progress.get_results(id).await {
            Ok(Some(results)) => return Ok(Some(results)),
            Ok(None) => {}
            Err(e) => warn!(analysis_id = %id, error = %e, "results cache unavailable"),
        }

        let record = self
            .deps
            .repository
            .get(id)
            .await?
            .ok_or(PipelineError::EntityNotFound(id))?;
        Ok(match (record.status, record.results) {
            (AnalysisStatus::Completed, Some(results)) => Some(ResultsRecord::new(
                results,
                record.processing_time.unwrap_or_default(),
            )),
            _ => None,
        })
    }

    /// Inbound callback from the processing service.
    #[instrument(skip(self, payload), fields(analysis_id = %payload.analysis_id, stage = %payload.stage))]
    pub async fn handle_callback(
        &self,
        payload: CallbackPayload,
    ) -> Result<CallbackOutcome, PipelineError> {
        let id = payload.analysis_id;
        match payload.stage {
            Stage::Completed => {
                let results = payload
                    .intermediate_results
                    .unwrap_or_else(|| JsonValue::Object(Default::default()));
                self.complete_processing(id, results).await?;
                Ok(CallbackOutcome::Completed)
            }
            Stage::Failed => {
                let message = if payload.message.is_empty() {
                    "Pipeline failed"
                } else {
                    payload.message.as_str()
                };
                self.fail_processing(id, message).await;
                Ok(CallbackOutcome::Failed)
            }
            _ => Ok(CallbackOutcome::Progress(
                self.update_progress(id, payload.to_update()).await?,
            )),
        }
    }

    async fn load_progress(&self, id: AnalysisId) -> Result<ProgressRecord, PipelineError> {
        match self.deps.progress.get_progress(id).await {
            Ok(Some(record)) => return Ok(record),
            Ok(None) => {}
            Err(e) => warn!(analysis_id = %id, error = %e, "progress cache unavailable"),
        }

        let stored = self
            .deps
            .repository
            .get(id)
            .await?
            .ok_or(PipelineError::EntityNotFound(id))?;
        Ok(snapshot(&stored, Utc::now()))
    }

    async fn cache_progress(&self, record: &ProgressRecord) {
        if let Err(e) = self
            .deps
            .progress
            .set_progress(record, self.deps.settings.ttl.progress)
            .await
        {
            warn!(analysis_id = %record.analysis_id, error = %e, "failed to cache progress");
        }
    }

    async fn sync_job_progress(&self, id: AnalysisId, progress: f64) {
        let job_id = JobId::new(pipeline_job_id(id));
        match self.deps.queue.update_progress(&job_id, progress).await {
            Ok(()) => {}
            Err(JobStoreError::NotFound(_)) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to update job progress"),
        }
    }

    async fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.deps.progress.publish(&event).await {
            warn!(
                analysis_id = %event.analysis_id(),
                kind = event.kind(),
                error = %e,
                "failed to publish progress event"
            );
        }
    }
}

/// Progress view of a persisted analysis, used when the cache has nothing.
fn snapshot(stored: &AnalysisRecord, now: DateTime<Utc>) -> ProgressRecord {
    let started_at = stored.started_at.unwrap_or(stored.updated_at);
    let mut record = ProgressRecord::queued(stored.id, started_at);
    let stage = stored.status.to_stage(f64::from(stored.progress));

    record.stage = stage;
    record.progress = match stored.status {
        AnalysisStatus::Completed => 100.0,
        _ => f64::from(stored.progress.clamp(0, 100)),
    };
    record.stage_progress = if stage == Stage::Completed { 100.0 } else { 0.0 };
    record
        .stage_start_times
        .entry(stage.as_str().to_string())
        .or_insert(stored.updated_at);
    record.message = stored
        .error_message
        .clone()
        .or_else(|| stored.progress_message.clone())
        .unwrap_or_else(|| QUEUED_MESSAGE.to_string());
    record.updated_at = stored.updated_at.min(now);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::{InMemoryProgressStore, ProgressStore};
    use crate::jobs::{InMemoryJobStore, JobState};
    use crate::processing::{PipelineRequest, PipelineResponse, ProcessingError, ProcessingService};
    use crate::records::{AnalysisRepository, InMemoryAnalysisRepository};

    struct NoopProcessing;

    #[async_trait]
    impl ProcessingService for NoopProcessing {
        async fn run_pipeline(
            &self,
            _request: PipelineRequest,
            _cancel: CancellationToken,
        ) -> Result<PipelineResponse, ProcessingError> {
            Ok(PipelineResponse {
                success: true,
                results: None,
                output_files: None,
                error: None,
            })
        }
    }

    struct Fixture {
        orchestrator: PipelineOrchestrator,
        repository: Arc<InMemoryAnalysisRepository>,
        progress: Arc<InMemoryProgressStore>,
        queue: JobQueue,
    }

    fn fixture_with(settings: PipelineSettings) -> Fixture {
        let repository = Arc::new(InMemoryAnalysisRepository::new());
        let progress = Arc::new(InMemoryProgressStore::new());
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let orchestrator = PipelineOrchestrator::new(PipelineDeps {
            repository: repository.clone(),
            progress: progress.clone(),
            queue: queue.clone(),
            processing: Arc::new(NoopProcessing),
            settings,
        });
        Fixture {
            orchestrator,
            repository,
            progress,
            queue,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PipelineSettings::default())
    }

    async fn seeded(f: &Fixture) -> AnalysisId {
        let id = AnalysisId::new();
        f.repository
            .insert(AnalysisRecord::pending(id, None, None))
            .await
            .unwrap();
        id
    }

    async fn start(f: &Fixture, id: AnalysisId) -> JobId {
        f.orchestrator
            .start_pipeline(id, vec![], json!({}), UserId::new())
            .await
            .unwrap()
    }

    fn update(stage: Stage, pct: f64) -> ProgressUpdate {
        ProgressUpdate::new(stage, pct, format!("{stage} {pct}"))
    }

    #[tokio::test]
    async fn start_initialises_record_and_enqueues_job() {
        let f = fixture();
        let id = seeded(&f).await;

        let job_id = start(&f, id).await;
        assert_eq!(job_id.as_str(), format!("analysis-{id}"));

        let job = f.queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.priority, 1);
        assert_eq!(job.retry_policy.max_attempts, 3);
        assert_eq!(job.retry_policy.base_delay, Duration::from_millis(5000));

        let stored = f.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Processing);
        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.stage, Stage::Queued);
        assert_eq!(progress.progress, 0.0);
    }

    #[tokio::test]
    async fn start_errors() {
        let f = fixture();
        let missing = f
            .orchestrator
            .start_pipeline(AnalysisId::new(), vec![], json!({}), UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, PipelineError::EntityNotFound(_)));

        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator.complete_processing(id, json!({})).await.unwrap();
        let completed = f
            .orchestrator
            .start_pipeline(id, vec![], json!({}), UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(completed, PipelineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn restart_while_processing_keeps_progress() {
        let f = fixture();
        let id = seeded(&f).await;
        let first = start(&f, id).await;
        f.orchestrator
            .update_progress(id, update(Stage::GroundClassification, 50.0))
            .await
            .unwrap();

        let second = start(&f, id).await;
        assert_eq!(first, second);
        assert_eq!(f.queue.stats(ANALYSIS_QUEUE).await.unwrap().waiting, 1);
        assert_eq!(f.orchestrator.get_progress(id).await.unwrap().progress, 10.0);
    }

    #[tokio::test]
    async fn full_run_scenario() {
        let f = fixture();
        let id = seeded(&f).await;
        let job_id = start(&f, id).await;
        let mut events = f.progress.subscribe(id).await.unwrap();

        f.orchestrator
            .update_progress(id, update(Stage::GroundClassification, 50.0))
            .await
            .unwrap();
        assert_eq!(f.orchestrator.get_progress(id).await.unwrap().progress, 10.0);

        f.orchestrator
            .update_progress(id, update(Stage::TreeDetection, 0.0))
            .await
            .unwrap();
        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.progress, 40.0);
        assert_eq!(progress.stage, Stage::TreeDetection);
        assert!(progress.stage_durations.contains_key("ground_classification"));
        assert_eq!(f.repository.get(id).await.unwrap().unwrap().progress, 40);
        assert_eq!(f.queue.get_job(&job_id).await.unwrap().unwrap().progress, 40.0);

        f.orchestrator
            .complete_processing(id, json!({"treeCount": 120, "averageHeight": 18.2}))
            .await
            .unwrap();
        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.stage, Stage::Completed);
        assert_eq!(progress.progress, 100.0);

        let results = f.orchestrator.get_results(id).await.unwrap().unwrap();
        assert_eq!(results.get("treeCount"), Some(&json!(120)));
        assert!(results.processing_time_secs().is_some());

        let stored = f.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Completed);
        assert_eq!(stored.statistics, Some(json!({"treeCount": 120, "averageHeight": 18.2})));

        let kinds: Vec<_> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(ProgressEvent::kind)
        .collect();
        assert_eq!(kinds, ["progress", "progress", "complete"]);
    }

    #[tokio::test]
    async fn regressing_update_is_ignored() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator
            .update_progress(id, update(Stage::TreeDetection, 50.0))
            .await
            .unwrap();

        let outcome = f
            .orchestrator
            .update_progress(id, update(Stage::GroundClassification, 90.0))
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(f.orchestrator.get_progress(id).await.unwrap().progress, 55.0);
    }

    #[tokio::test]
    async fn concurrent_updates_end_at_the_highest() {
        let f = Arc::new(fixture());
        let id = seeded(&f).await;
        start(&f, id).await;

        let mut tasks = Vec::new();
        for pct in [10.0, 60.0, 30.0, 90.0, 20.0] {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.orchestrator
                    .update_progress(id, update(Stage::HeightNormalization, pct))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.stage_progress, 90.0);
        assert_eq!(progress.progress, 38.0);
    }

    #[tokio::test]
    async fn fail_is_idempotent() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;

        f.orchestrator.fail_processing(id, "out of memory").await;
        let first = f.orchestrator.get_progress(id).await.unwrap();
        f.orchestrator.fail_processing(id, "out of memory").await;
        let second = f.orchestrator.get_progress(id).await.unwrap();

        assert_eq!(first.stage, Stage::Failed);
        assert_eq!(second.stage, Stage::Failed);
        assert_eq!(first.message, second.message);
        let stored = f.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn fail_does_not_override_completion() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator.complete_processing(id, json!({})).await.unwrap();

        f.orchestrator.fail_processing(id, "late failure").await;
        let stored = f.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_waiting_job_removes_it() {
        let f = fixture();
        let id = seeded(&f).await;
        let job_id = start(&f, id).await;

        assert!(f.orchestrator.cancel_processing(id).await.unwrap());
        assert!(f.queue.get_job(&job_id).await.unwrap().is_none());
        assert!(f.orchestrator.is_cancelled(id).await);

        let stored = f.repository.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Cancelled);
        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.stage, Stage::Failed);
        assert_eq!(progress.message, CANCELLED_MESSAGE);
    }

    #[tokio::test]
    async fn cancel_active_job_sets_flag_and_fires_local_token() {
        let f = fixture();
        let id = seeded(&f).await;
        let job_id = start(&f, id).await;
        f.queue.store().claim_next(ANALYSIS_QUEUE).await.unwrap().unwrap();
        let token = f.orchestrator.register_run(id);

        assert!(f.orchestrator.cancel_processing(id).await.unwrap());
        assert!(token.is_cancelled());
        assert_eq!(f.queue.get_state(&job_id).await.unwrap(), Some(JobState::Active));
        assert!(f.progress.is_cancelled(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_errors() {
        let f = fixture();
        let missing = f.orchestrator.cancel_processing(AnalysisId::new()).await;
        assert!(matches!(missing, Err(PipelineError::EntityNotFound(_))));

        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator.complete_processing(id, json!({})).await.unwrap();
        let completed = f.orchestrator.cancel_processing(id).await;
        assert!(matches!(completed, Err(PipelineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn restart_after_cancel_clears_flag() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator.cancel_processing(id).await.unwrap();

        start(&f, id).await;
        assert!(!f.orchestrator.is_cancelled(id).await);
        assert_eq!(f.orchestrator.get_progress(id).await.unwrap().stage, Stage::Queued);
    }

    #[tokio::test]
    async fn expired_cache_falls_back_to_system_of_record() {
        let mut settings = PipelineSettings::default();
        settings.ttl.progress = Duration::from_millis(50);
        let f = fixture_with(settings);
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator
            .update_progress(id, update(Stage::TreeDetection, 50.0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.progress.get_progress(id).await.unwrap().is_none());

        let progress = f.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(progress.stage, Stage::TreeDetection);
        assert_eq!(progress.progress, 55.0);
    }

    #[tokio::test]
    async fn results_fall_back_to_system_of_record() {
        let mut settings = PipelineSettings::default();
        settings.ttl.results = Duration::from_millis(50);
        let f = fixture_with(settings);
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator
            .complete_processing(id, json!({"treeCount": 120}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let results = f.orchestrator.get_results(id).await.unwrap().unwrap();
        assert_eq!(results.get("treeCount"), Some(&json!(120)));
    }

    #[tokio::test]
    async fn callbacks_route_by_stage() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;

        let progress = CallbackPayload {
            analysis_id: id,
            stage: Stage::HeightNormalization,
            progress: 50.0,
            message: "normalising".into(),
            intermediate_results: None,
        };
        assert!(matches!(
            f.orchestrator.handle_callback(progress).await.unwrap(),
            CallbackOutcome::Progress(ProgressOutcome::Applied(_))
        ));

        let done = CallbackPayload {
            analysis_id: id,
            stage: Stage::Completed,
            progress: 100.0,
            message: String::new(),
            intermediate_results: Some(json!({"treeCount": 7})),
        };
        assert_eq!(
            f.orchestrator.handle_callback(done).await.unwrap(),
            CallbackOutcome::Completed
        );
        let results = f.orchestrator.get_results(id).await.unwrap().unwrap();
        assert_eq!(results.get("treeCount"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn completion_after_cancel_is_refused() {
        let f = fixture();
        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator.cancel_processing(id).await.unwrap();

        let err = f
            .orchestrator
            .complete_processing(id, json!({"treeCount": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CancelledByUser(_)));
    }

    #[tokio::test]
    async fn per_analysis_locks_do_not_outlive_their_callers() {
        let f = Arc::new(fixture());
        for _ in 0..1000 {
            let err = f
                .orchestrator
                .handle_callback(CallbackPayload {
                    analysis_id: AnalysisId::new(),
                    stage: Stage::TreeDetection,
                    progress: 10.0,
                    message: String::new(),
                    intermediate_results: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::EntityNotFound(_)));
        }
        assert_eq!(f.orchestrator.tracked_locks(), 0);

        let id = seeded(&f).await;
        start(&f, id).await;
        f.orchestrator
            .update_progress(id, update(Stage::TreeDetection, 50.0))
            .await
            .unwrap();
        f.orchestrator
            .update_progress(id, update(Stage::GroundClassification, 10.0))
            .await
            .unwrap();
        assert_eq!(f.orchestrator.tracked_locks(), 0);

        // Contended: the entry lives while anyone waits, then goes away.
        let mut tasks = Vec::new();
        for pct in [55.0, 60.0, 65.0, 70.0] {
            let f = f.clone();
            tasks.push(tokio::spawn(async move {
                f.orchestrator
                    .update_progress(id, update(Stage::TreeDetection, pct))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(f.orchestrator.tracked_locks(), 0);
        assert_eq!(f.orchestrator.get_progress(id).await.unwrap().stage_progress, 70.0);
    }
}
