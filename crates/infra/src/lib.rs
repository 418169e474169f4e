//! Infrastructure layer: job queue, progress cache, system of record,
//! processing-service client, and the pipeline that ties them together.

pub mod cache;
pub mod config;
pub mod jobs;
pub mod pipeline;
pub mod processing;
pub mod records;

pub use config::{CanopyConfig, ConfigError};
pub use pipeline::{PipelineDeps, PipelineError, PipelineOrchestrator, PipelineSettings};
