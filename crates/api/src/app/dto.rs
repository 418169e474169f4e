//! Request/response bodies of the HTTP API (camelCase JSON).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use canopy_analysis::{InputFile, ProgressRecord};
use canopy_infra::jobs::{Job, JobState, JobStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisRequest {
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisResponse {
    pub job_id: String,
}

/// Results not available yet: the run's current progress instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResultsResponse {
    pub status: &'static str,
    pub progress: ProgressRecord,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub state: JobState,
    pub progress: f64,
    pub priority: i32,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let error = match &job.status {
            JobStatus::Delayed { error, .. } | JobStatus::Failed { error, .. } => {
                Some(error.clone())
            }
            _ => None,
        };
        Self {
            id: job.id.to_string(),
            state: job.state(),
            queue: job.queue,
            name: job.name,
            progress: job.progress,
            priority: job.priority,
            attempt: job.attempt,
            max_attempts: job.retry_policy.max_attempts,
            error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            scheduled_at: job.scheduled_at,
        }
    }
}
