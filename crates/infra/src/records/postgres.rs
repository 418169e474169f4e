//! Postgres-backed analysis repository (table `analyses`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use canopy_analysis::AnalysisStatus;
use canopy_core::{AnalysisId, ProjectId, UserId};

use super::{AnalysisRecord, AnalysisRepository, Completion, RepositoryError};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id               UUID PRIMARY KEY,
        project_id       UUID NULL,
        user_id          UUID NULL,
        status           TEXT NOT NULL,
        progress         INTEGER NOT NULL DEFAULT 0,
        progress_message TEXT NULL,
        started_at       TIMESTAMPTZ NULL,
        completed_at     TIMESTAMPTZ NULL,
        processing_time  DOUBLE PRECISION NULL,
        results          JSONB NULL,
        statistics       JSONB NULL,
        error_message    TEXT NULL,
        updated_at       TIMESTAMPTZ NOT NULL
    )
"#;

#[derive(Debug, Clone)]
pub struct PostgresAnalysisRepository {
    pool: Arc<PgPool>,
}

impl PostgresAnalysisRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

fn uuid(id: AnalysisId) -> Uuid {
    id.into()
}

fn expect_row(id: AnalysisId, result: PgQueryResult) -> Result<(), RepositoryError> {
    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound(id));
    }
    Ok(())
}

fn decode(row: &PgRow) -> Result<AnalysisRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<AnalysisStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let results: Option<Json<JsonValue>> = row.try_get("results")?;
    let statistics: Option<Json<JsonValue>> = row.try_get("statistics")?;

    Ok(AnalysisRecord {
        id: AnalysisId::from_uuid(row.try_get("id")?),
        project_id: row.try_get::<Option<Uuid>, _>("project_id")?.map(ProjectId::from),
        user_id: row.try_get::<Option<Uuid>, _>("user_id")?.map(UserId::from),
        status,
        progress: row.try_get("progress")?,
        progress_message: row.try_get("progress_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        processing_time: row.try_get("processing_time")?,
        results: results.map(|Json(v)| v),
        statistics: statistics.map(|Json(v)| v),
        error_message: row.try_get("error_message")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AnalysisRepository for PostgresAnalysisRepository {
    async fn get(&self, id: AnalysisId) -> Result<Option<AnalysisRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM analyses WHERE id = $1")
            .bind(uuid(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref()
            .map(decode)
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self, record), fields(analysis_id = %record.id), err)]
    async fn insert(&self, record: AnalysisRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO analyses (
                id, project_id, user_id, status, progress, progress_message, started_at,
                completed_at, processing_time, results, statistics, error_message, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                progress_message = EXCLUDED.progress_message,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                processing_time = EXCLUDED.processing_time,
                results = EXCLUDED.results,
                statistics = EXCLUDED.statistics,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(uuid(record.id))
        .bind(record.project_id.map(Uuid::from))
        .bind(record.user_id.map(Uuid::from))
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(&record.progress_message)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.processing_time)
        .bind(record.results.as_ref().map(Json))
        .bind(record.statistics.as_ref().map(Json))
        .bind(&record.error_message)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn mark_processing(
        &self,
        id: AnalysisId,
        message: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE analyses
            SET status = $2, progress = 0, progress_message = $3, started_at = $4,
                completed_at = NULL, processing_time = NULL, results = NULL,
                statistics = NULL, error_message = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(uuid(id))
        .bind(AnalysisStatus::Processing.as_str())
        .bind(message)
        .bind(started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;
        expect_row(id, result)
    }

    async fn update_progress(
        &self,
        id: AnalysisId,
        progress: i32,
        message: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE analyses
            SET progress = $2, progress_message = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(uuid(id))
        .bind(progress)
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;
        expect_row(id, result)
    }

    #[instrument(skip(self, completion), err)]
    async fn complete(&self, id: AnalysisId, completion: Completion) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE analyses
            SET status = $2, progress = 100, progress_message = 'Analysis completed',
                completed_at = $3, processing_time = $4, results = $5, statistics = $6,
                error_message = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(uuid(id))
        .bind(AnalysisStatus::Completed.as_str())
        .bind(completion.completed_at)
        .bind(completion.processing_time_secs)
        .bind(Json(&completion.results))
        .bind(Json(&completion.statistics))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        expect_row(id, result)
    }

    #[instrument(skip(self), err)]
    async fn fail(&self, id: AnalysisId, error: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE analyses SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(uuid(id))
        .bind(AnalysisStatus::Failed.as_str())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        expect_row(id, result)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: AnalysisId, message: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE analyses SET status = $2, progress_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(uuid(id))
        .bind(AnalysisStatus::Cancelled.as_str())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;
        expect_row(id, result)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => RepositoryError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
