//! System of record for analyses.
//!
//! Only the columns the pipeline writes are modelled here; the rest of the
//! analysis entity (names, file uploads, project membership) is owned by the
//! CRUD layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use canopy_analysis::AnalysisStatus;
use canopy_core::{AnalysisId, ProjectId, UserId};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryAnalysisRepository;
pub use postgres::PostgresAnalysisRepository;

/// Durable snapshot of an analysis as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: AnalysisId,
    pub project_id: Option<ProjectId>,
    pub user_id: Option<UserId>,
    pub status: AnalysisStatus,
    /// Coarse overall percent (0–100).
    pub progress: i32,
    pub progress_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub processing_time: Option<f64>,
    pub results: Option<JsonValue>,
    pub statistics: Option<JsonValue>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// A record that has never been started.
    pub fn pending(id: AnalysisId, project_id: Option<ProjectId>, user_id: Option<UserId>) -> Self {
        Self {
            id,
            project_id,
            user_id,
            status: AnalysisStatus::Pending,
            progress: 0,
            progress_message: None,
            started_at: None,
            completed_at: None,
            processing_time: None,
            results: None,
            statistics: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

/// Final outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub results: JsonValue,
    pub statistics: JsonValue,
    pub processing_time_secs: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("analysis not found: {0}")]
    NotFound(AnalysisId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Pipeline-facing writes against the analyses table.
///
/// Every write to an unknown id is `RepositoryError::NotFound`.
#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>, RepositoryError>;

    /// Insert or replace a record.
    async fn insert(&self, record: AnalysisRecord) -> Result<(), RepositoryError>;

    /// `PROCESSING` at 0%, start time set, previous outcome cleared.
    async fn mark_processing(
        &self,
        id: AnalysisId,
        message: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn update_progress(
        &self,
        id: AnalysisId,
        progress: i32,
        message: &str,
    ) -> Result<(), RepositoryError>;

    async fn complete(&self, id: AnalysisId, completion: Completion) -> Result<(), RepositoryError>;

    async fn fail(&self, id: AnalysisId, error: &str) -> Result<(), RepositoryError>;

    async fn cancel(&self, id: AnalysisId, message: &str) -> Result<(), RepositoryError>;
}

/// Overall percent as stored in the `progress` column.
pub fn persisted_percent(progress: f64) -> i32 {
    if progress.is_nan() {
        return 0;
    }
    progress.clamp(0.0, 100.0).round() as i32
}
