//! Postgres-backed job store.
//!
//! Each job is stored as a JSONB document next to the columns the claim query
//! filters and sorts on. Claiming uses `FOR UPDATE SKIP LOCKED`, so several
//! worker processes can poll the same queue without leasing a job twice.
//! A lease lives as long as its row's `updated_at` keeps moving (heartbeats
//! and progress writes); rows left `active` past the lease are taken back by
//! `recover_expired`.
//!
//! | SQLx error | code | JobStoreError |
//! |---|---|---|
//! | unique violation | `23505` | handled by `enqueue` as a duplicate |
//! | anything else | any | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, instrument};

use super::store::{JobStats, JobStore, JobStoreError, ensure_claimable, lease_expired_message};
use super::types::{EnqueueOutcome, Job, JobId, JobState};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          TEXT PRIMARY KEY,
        queue       TEXT NOT NULL,
        name        TEXT NOT NULL,
        state       TEXT NOT NULL,
        priority    INTEGER NOT NULL,
        run_at      TIMESTAMPTZ NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL,
        data        JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_idx
        ON jobs (queue, state, priority, created_at)
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its claim index if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn write(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        insert: bool,
    ) -> Result<(), sqlx::Error> {
        let sql = if insert {
            r#"
            INSERT INTO jobs (id, queue, name, state, priority, run_at, created_at, updated_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#
        } else {
            r#"
            UPDATE jobs
            SET queue = $2, name = $3, state = $4, priority = $5, run_at = $6,
                created_at = $7, updated_at = $8, data = $9
            WHERE id = $1
            "#
        };

        sqlx::query(sql)
            .bind(job.id.as_str())
            .bind(&job.queue)
            .bind(&job.name)
            .bind(job.state().as_str())
            .bind(job.priority)
            .bind(run_at(job))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(Json(job))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

fn run_at(job: &Job) -> DateTime<Utc> {
    job.scheduled_at.unwrap_or(job.created_at)
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(job): Json<Job> = row
        .try_get("data")
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    Ok(job)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut tx = self.begin("enqueue").await?;

        let existing = sqlx::query("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job.id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        let outcome = match existing {
            Some(row) => {
                let state: String = row
                    .try_get("state")
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                if !is_terminal_state(&state) {
                    tx.rollback().await.ok();
                    return Ok(EnqueueOutcome::Duplicate(job.id));
                }
                Self::write(&mut tx, &job, false)
                    .await
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                EnqueueOutcome::Replaced(job.id.clone())
            }
            None => match Self::write(&mut tx, &job, true).await {
                Ok(()) => EnqueueOutcome::Created(job.id.clone()),
                // A concurrent producer inserted the same id first.
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await.ok();
                    return Ok(EnqueueOutcome::Duplicate(job.id));
                }
                Err(e) => return Err(map_sqlx_error("enqueue", e)),
            },
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(outcome)
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = $1")
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, priority = $3, run_at = $4, updated_at = $5, data = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.state().as_str())
        .bind(job.priority)
        .bind(run_at(job))
        .bind(job.updated_at)
        .bind(Json(job))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id), err)]
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin("claim_next").await?;

        let row = sqlx::query(
            r#"
            SELECT data
            FROM jobs
            WHERE queue = $1
              AND state IN ('waiting', 'delayed')
              AND run_at <= $2
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let mut job = decode(&row)?;
        ensure_claimable(&job)?;
        job.mark_active();
        Span::current().record("job_id", job.id.as_str());

        Self::write(&mut tx, &job, false)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        debug!(job_id = %job.id, attempt = job.attempt, "leased job");
        Ok(Some(job))
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        let mut tx = self.begin("remove").await?;

        let row = sqlx::query("SELECT state FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(false);
        };
        let state: String = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("remove", e))?;
        let state = parse_state(&state)?;
        if !matches!(state, JobState::Waiting | JobState::Delayed) {
            tx.rollback().await.ok();
            return Err(JobStoreError::InvalidState {
                job_id: job_id.clone(),
                state,
            });
        }

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("remove", e))?;
        Ok(true)
    }

    async fn set_progress(&self, job_id: &JobId, progress: f64) -> Result<(), JobStoreError> {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated_at = $3,
                data = jsonb_set(
                    jsonb_set(data, '{progress}', to_jsonb($2::float8)),
                    '{updated_at}', to_jsonb($3::timestamptz)
                )
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_str())
        .bind(progress)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_progress", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id.clone()));
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: &JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET updated_at = $2,
                data = jsonb_set(data, '{updated_at}', to_jsonb($2::timestamptz))
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(job_id.as_str())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn recover_expired(&self, queue: &str, lease: Duration) -> Result<Vec<Job>, JobStoreError> {
        let lease_chrono = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(lease_chrono) else {
            return Ok(Vec::new());
        };
        let mut tx = self.begin("recover_expired").await?;

        let rows = sqlx::query(
            r#"
            SELECT data
            FROM jobs
            WHERE queue = $1 AND state = 'active' AND updated_at <= $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_expired", e))?;

        let mut recovered = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = decode(row)?;
            let last_seen = job.updated_at;
            job.mark_failed(lease_expired_message(lease), last_seen);
            Self::write(&mut tx, &job, false)
                .await
                .map_err(|e| map_sqlx_error("recover_expired", e))?;
            recovered.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("recover_expired", e))?;
        Ok(recovered)
    }

    async fn list_by_state(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data
            FROM jobs
            WHERE queue = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(queue)
        .bind(state.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(decode).collect()
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            stats.add(parse_state(&state)?, count.max(0) as usize);
        }
        Ok(stats)
    }
}

fn parse_state(raw: &str) -> Result<JobState, JobStoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| JobStoreError::Storage(format!("unknown job state `{raw}`")))
}

fn is_terminal_state(raw: &str) -> bool {
    matches!(raw, "completed" | "failed" | "cancelled")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
