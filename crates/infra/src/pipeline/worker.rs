//! Worker side of the pipeline: the `full-pipeline` job handler.
//!
//! A run is cancelled cooperatively. The handler checks the Cancellation Flag
//! before starting, and while the external request is in flight a watcher
//! re-reads the flag so a cancel issued from another process aborts the call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use canopy_analysis::{
    ANALYSIS_QUEUE, FULL_PIPELINE_JOB, PipelineJobPayload, ProgressUpdate, Stage,
};
use canopy_core::AnalysisId;

use crate::config::WorkerSettings;
use crate::jobs::{
    Job, JobEventListener, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler,
    JobResult,
};
use crate::processing::{PipelineRequest, ProcessingError};

use super::{PipelineError, PipelineOrchestrator};

pub struct PipelineJobHandler {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineJobHandler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn run(&self, payload: PipelineJobPayload) -> JobResult {
        let id = payload.analysis_id;
        let orchestrator = &self.orchestrator;

        if orchestrator.is_cancelled(id).await {
            info!(analysis_id = %id, "analysis cancelled before start");
            return JobResult::Cancelled("cancelled before start".to_string());
        }

        let start = ProgressUpdate::new(
            Stage::GroundClassification,
            0.0,
            "Starting ground classification",
        );
        if let Err(e) = orchestrator.update_progress(id, start).await {
            return JobResult::Failure(e.to_string());
        }

        let settings = orchestrator.settings();
        let request = PipelineRequest {
            analysis_id: id,
            files: payload.files,
            parameters: payload.parameters,
            callback_url: settings.processing.callback_url(),
            storage_config: settings.processing.storage.clone(),
        };

        let cancel = orchestrator.register_run(id);
        let watcher_stop = CancellationToken::new();
        tokio::spawn(watch_cancel_flag(
            orchestrator.clone(),
            id,
            cancel.clone(),
            watcher_stop.clone(),
            settings.cancel_poll_interval,
        ));
        let _stop_watcher = watcher_stop.drop_guard();

        let response = orchestrator
            .deps()
            .processing
            .run_pipeline(request, cancel)
            .await;
        orchestrator.finish_run(id);

        let response = match response {
            Ok(response) => response,
            Err(ProcessingError::Cancelled) => {
                return JobResult::Cancelled("cancelled by user".to_string());
            }
            Err(e) => {
                warn!(analysis_id = %id, error = %e, "processing request failed");
                return JobResult::Failure(e.to_string());
            }
        };

        let Some(results) = response.synchronous_results().cloned() else {
            debug!(analysis_id = %id, "processing acknowledged, awaiting callbacks");
            return JobResult::Success;
        };

        match orchestrator.complete_processing(id, results).await {
            Ok(_) => JobResult::Success,
            Err(PipelineError::CancelledByUser(_)) => {
                JobResult::Cancelled("cancelled by user".to_string())
            }
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn handle(&self, job: Job) -> JobResult {
        let payload: PipelineJobPayload = match serde_json::from_value(job.payload) {
            Ok(p) => p,
            Err(e) => return JobResult::Failure(format!("invalid pipeline payload: {e}")),
        };
        debug!(
            job_id = %job.id,
            analysis_id = %payload.analysis_id,
            attempt = job.attempt,
            "running pipeline job"
        );
        self.run(payload).await
    }
}

async fn watch_cancel_flag(
    orchestrator: Arc<PipelineOrchestrator>,
    id: AnalysisId,
    cancel: CancellationToken,
    stop: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if orchestrator.is_cancelled(id).await {
            info!(analysis_id = %id, "cancellation flag observed, aborting run");
            cancel.cancel();
            return;
        }
    }
}

/// Reports terminal job failures. The only place a failed job fails its analysis.
pub struct PipelineFailureListener {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineFailureListener {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobEventListener for PipelineFailureListener {
    async fn on_failed(&self, job: &Job, error: &str) {
        if job.name != FULL_PIPELINE_JOB {
            return;
        }
        match serde_json::from_value::<PipelineJobPayload>(job.payload.clone()) {
            Ok(payload) => {
                self.orchestrator
                    .fail_processing(payload.analysis_id, error)
                    .await
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed job has an unreadable payload"),
        }
    }
}

pub fn worker_config(settings: &WorkerSettings) -> JobExecutorConfig {
    JobExecutorConfig::new(ANALYSIS_QUEUE)
        .with_name("pipeline-worker")
        .with_max_concurrent(settings.concurrency)
        .with_poll_interval(settings.poll_interval)
        .with_lease_timeout(settings.lease_timeout)
}

/// Start consuming the analysis queue.
pub fn spawn_pipeline_worker(
    orchestrator: Arc<PipelineOrchestrator>,
    config: JobExecutorConfig,
) -> JobExecutorHandle {
    let mut executor = JobExecutor::new(orchestrator.queue());
    executor.register_handler(FULL_PIPELINE_JOB, PipelineJobHandler::new(orchestrator.clone()));
    executor.register_listener(Arc::new(PipelineFailureListener::new(orchestrator)));
    info!(queue = %config.queue, concurrency = config.max_concurrent, "starting pipeline worker");
    executor.spawn(config)
}
