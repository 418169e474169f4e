use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use canopy_analysis::AnalysisStatus;
use canopy_core::AnalysisId;

use super::{AnalysisRecord, AnalysisRepository, Completion, RepositoryError};

#[derive(Debug, Default)]
pub struct InMemoryAnalysisRepository {
    records: RwLock<HashMap<AnalysisId, AnalysisRecord>>,
}

impl InMemoryAnalysisRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify(
        &self,
        id: AnalysisId,
        f: impl FnOnce(&mut AnalysisRecord) + Send,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        f(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl AnalysisRepository for InMemoryAnalysisRepository {
    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn insert(&self, record: AnalysisRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn mark_processing(
        &self,
        id: AnalysisId,
        message: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.modify(id, |r| {
            r.status = AnalysisStatus::Processing;
            r.progress = 0;
            r.progress_message = Some(message.to_string());
            r.started_at = Some(started_at);
            r.completed_at = None;
            r.processing_time = None;
            r.results = None;
            r.statistics = None;
            r.error_message = None;
        })
        .await
    }

    async fn update_progress(
        &self,
        id: AnalysisId,
        progress: i32,
        message: &str,
    ) -> Result<(), RepositoryError> {
        self.modify(id, |r| {
            r.progress = progress;
            r.progress_message = Some(message.to_string());
        })
        .await
    }

    async fn complete(&self, id: AnalysisId, completion: Completion) -> Result<(), RepositoryError> {
        self.modify(id, |r| {
            r.status = AnalysisStatus::Completed;
            r.progress = 100;
            r.progress_message = Some("Analysis completed".to_string());
            r.completed_at = Some(completion.completed_at);
            r.processing_time = Some(completion.processing_time_secs);
            r.results = Some(completion.results);
            r.statistics = Some(completion.statistics);
            r.error_message = None;
        })
        .await
    }

    async fn fail(&self, id: AnalysisId, error: &str) -> Result<(), RepositoryError> {
        self.modify(id, |r| {
            r.status = AnalysisStatus::Failed;
            r.error_message = Some(error.to_string());
        })
        .await
    }

    async fn cancel(&self, id: AnalysisId, message: &str) -> Result<(), RepositoryError> {
        self.modify(id, |r| {
            r.status = AnalysisStatus::Cancelled;
            r.progress_message = Some(message.to_string());
        })
        .await
    }
}
