//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Job identifier. Callers may pick a deterministic id (`analysis-<id>`)
/// so that re-enqueueing the same logical work collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random, time-ordered id for jobs without a natural key.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Leased to a worker
    Active,
    /// Failed, will be retried once the backoff elapses
    Delayed { error: String, attempt: u32 },
    /// Completed successfully
    Completed,
    /// Exhausted its attempts
    Failed { error: String, attempts: u32 },
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    /// Still eligible to be claimed by a worker.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed { .. })
    }

    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Waiting => JobState::Waiting,
            JobStatus::Active => JobState::Active,
            JobStatus::Delayed { .. } => JobState::Delayed,
            JobStatus::Completed => JobState::Completed,
            JobStatus::Failed { .. } => JobState::Failed,
            JobStatus::Cancelled => JobState::Cancelled,
        }
    }
}

/// Flat projection of [`JobStatus`] without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts ran.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Enqueue options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: Option<JobId>,
    /// Lower runs sooner
    pub priority: i32,
    pub retry_policy: Option<RetryPolicy>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Handler routing key
    pub name: String,
    pub payload: JsonValue,
    /// Lower runs sooner
    pub priority: i32,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far
    pub attempt: u32,
    /// Job-level progress (0–100)
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            queue: queue.into(),
            name: name.into(),
            payload,
            priority: 0,
            status: JobStatus::Waiting,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    /// Build a job from enqueue options.
    pub fn from_options(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: JsonValue,
        options: JobOptions,
    ) -> Self {
        let mut job = Self::new(queue, name, payload);
        if let Some(id) = options.job_id {
            job = job.with_id(id);
        }
        job.priority = options.priority;
        if let Some(policy) = options.retry_policy {
            job.retry_policy = policy;
        }
        if let Some(delay) = options.delay {
            job = job.delayed(delay);
        }
        job
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Hold the job back for `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && self.scheduled_at.is_none_or(|at| now >= at)
    }

    /// Active, but neither heartbeat nor progress for at least `lease`.
    pub fn is_lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        matches!(self.status, JobStatus::Active) && now - self.updated_at >= lease
    }

    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Record a failed attempt and either schedule a retry or fail for good.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error.clone()),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Delayed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::Failed {
                error,
                attempts: self.attempt,
            };
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.scheduled_at = None;
        self.updated_at = Utc::now();
    }

    pub fn set_progress(&mut self, progress: f64) {
        self.progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        self.updated_at = Utc::now();
    }
}

/// Outcome reported by a job handler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success,
    /// Attempt failed; retried per the job's policy
    Failure(String),
    /// Stop without failing
    Cancelled(String),
}

/// What `enqueue` did with the submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobId),
    /// A terminal job with the same id was replaced.
    Replaced(JobId),
    /// A live job with the same id already exists; nothing was written.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            EnqueueOutcome::Created(id)
            | EnqueueOutcome::Replaced(id)
            | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn into_job_id(self) -> JobId {
        match self {
            EnqueueOutcome::Created(id)
            | EnqueueOutcome::Replaced(id)
            | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}
