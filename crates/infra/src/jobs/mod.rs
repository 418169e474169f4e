//! Durable job queue with priorities, retry and backoff.
//!
//! - `Job`: unit of queued work, payload plus lifecycle metadata
//! - `JobStore`: persistence (in-memory or Postgres) with lease semantics
//! - `JobQueue`: producer facade that wakes local executors on enqueue
//! - `JobExecutor`: bounded-concurrency consumer applying the retry policy

pub mod executor;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use executor::{
    AttemptOutcome, ExecutorStats, JobEventListener, JobExecutor, JobExecutorConfig,
    JobExecutorHandle, JobHandler,
};
pub use postgres::PostgresJobStore;
pub use queue::JobQueue;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, EnqueueOutcome, Job, JobAttemptRecord, JobId, JobOptions, JobResult,
    JobState, JobStatus, RetryPolicy,
};
