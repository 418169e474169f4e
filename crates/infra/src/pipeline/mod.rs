//! Pipeline orchestration: the run lifecycle of an analysis and the worker
//! that drives the external processing service.

use std::sync::Arc;
use std::time::Duration;

use canopy_analysis::{ProgressTransition, UpdateRejected};
use canopy_core::AnalysisId;

use crate::cache::{CacheError, ProgressStore};
use crate::config::{CanopyConfig, JobSettings, ProcessingSettings, TtlSettings};
use crate::jobs::{JobQueue, JobStoreError};
use crate::processing::{ProcessingError, ProcessingService};
use crate::records::{AnalysisRepository, RepositoryError};

pub mod orchestrator;
pub mod worker;

pub use orchestrator::PipelineOrchestrator;
pub use worker::{
    PipelineFailureListener, PipelineJobHandler, spawn_pipeline_worker, worker_config,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("analysis not found: {0}")]
    EntityNotFound(AnalysisId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("processing service error: {message}")]
    ExternalService { status: Option<u16>, message: String },

    #[error("progress cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    #[error("analysis {0} was cancelled by the user")]
    CancelledByUser(AnalysisId),

    #[error("repository error: {0}")]
    Repository(RepositoryError),

    #[error("job queue error: {0}")]
    Queue(#[from] JobStoreError),
}

impl From<RepositoryError> for PipelineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => PipelineError::EntityNotFound(id),
            other => PipelineError::Repository(other),
        }
    }
}

impl PipelineError {
    pub fn from_processing(id: AnalysisId, e: ProcessingError) -> Self {
        match e {
            ProcessingError::ExternalService { status, message } => {
                PipelineError::ExternalService { status, message }
            }
            ProcessingError::Cancelled => PipelineError::CancelledByUser(id),
        }
    }
}

/// Result of a progress report.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressOutcome {
    Applied(ProgressTransition),
    /// Out-of-order or post-terminal report; nothing was written.
    Ignored(UpdateRejected),
}

impl ProgressOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProgressOutcome::Applied(_))
    }
}

/// What an inbound callback did.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Progress(ProgressOutcome),
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ttl: TtlSettings,
    pub jobs: JobSettings,
    pub processing: ProcessingSettings,
    pub cancel_poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let config = CanopyConfig::default();
        Self::from_config(&config)
    }
}

impl PipelineSettings {
    pub fn from_config(config: &CanopyConfig) -> Self {
        Self {
            ttl: config.ttl,
            jobs: config.jobs.clone(),
            processing: config.processing.clone(),
            cancel_poll_interval: config.worker.cancel_poll_interval,
        }
    }
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub repository: Arc<dyn AnalysisRepository>,
    pub progress: Arc<dyn ProgressStore>,
    pub queue: JobQueue,
    pub processing: Arc<dyn ProcessingService>,
    pub settings: PipelineSettings,
}
