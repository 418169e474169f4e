//! `canopy-analysis`: the analysis pipeline's domain model.
//!
//! Pure types and computations shared by the orchestrator, the workers and the
//! HTTP layer:
//! - `stage`: pipeline stages, their weights and overall progress arithmetic
//! - `progress`: the cached Progress Record and its guarded update rules
//! - `results`: the Results Record and summary statistics extraction
//! - `status`: the system-of-record status enum
//! - `event`: progress events fanned out to subscribers
//! - `payload`: queue job payload and external callback contract

pub mod event;
pub mod payload;
pub mod progress;
pub mod results;
pub mod stage;
pub mod status;

pub use event::ProgressEvent;
pub use payload::{
    ANALYSIS_QUEUE, CallbackPayload, FULL_PIPELINE_JOB, InputFile, PipelineJobPayload,
    pipeline_job_id,
};
pub use progress::{ProgressRecord, ProgressTransition, ProgressUpdate, UpdateRejected};
pub use results::{PROCESSING_TIME_FIELD, ResultsRecord, summary_statistics};
pub use stage::{Stage, estimate_completion, overall_progress, stage_for_progress};
pub use status::AnalysisStatus;
