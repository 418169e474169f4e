//! Job executor: leases jobs, runs handlers, applies retry and backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobResult, JobStatus};

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_LEASE_TIMEOUT: Duration = Duration::from_millis(300);

/// Heartbeats land several times per lease.
fn heartbeat_interval(lease: Duration) -> Duration {
    lease / 3
}

/// Runs one attempt of a job.
///
/// Handlers report failures through [`JobResult`]; they never decide whether
/// a failure is terminal. That is the retry policy's call.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> JobResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: Job) -> JobResult {
        (self)(job).await
    }
}

/// Lifecycle hooks fired after a job outcome has been stored.
///
/// `on_failed` fires once per job, when its last attempt fails.
#[async_trait]
pub trait JobEventListener: Send + Sync {
    async fn on_completed(&self, _job: &Job) {}

    async fn on_failed(&self, job: &Job, error: &str);
}

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Queue to consume
    pub queue: String,
    /// How often to poll when no wake-up arrives
    pub poll_interval: Duration,
    /// Maximum concurrently active jobs
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
    /// An active job whose row has not been touched for this long is
    /// considered abandoned and taken back
    pub lease_timeout: Duration,
}

impl JobExecutorConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            name: format!("{queue}-executor"),
            queue,
            poll_interval: Duration::from_millis(500),
            max_concurrent: 2,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease.max(MIN_LEASE_TIMEOUT);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Stop leasing new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "job executor task ended abnormally");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Retrying,
    Failed,
    Cancelled,
    /// The job vanished from the store while it ran.
    Gone,
}

/// Background job executor.
///
/// Leases jobs from a store, runs them with registered handlers, and applies
/// the retry policy.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    notify: Arc<Notify>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    listeners: Vec<Arc<dyn JobEventListener>>,
    lease_timeout: Duration,
}

impl JobExecutor {
    pub fn new(queue: &JobQueue) -> Self {
        Self {
            store: queue.store(),
            notify: queue.notifier(),
            handlers: HashMap::new(),
            listeners: Vec::new(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    /// Register a handler for a job name: exact, `prefix.*`, or `*`.
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn register_listener(&mut self, listener: Arc<dyn JobEventListener>) {
        self.listeners.push(listener);
    }

    fn get_handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(name) {
            return Some(h.clone());
        }

        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name.starts_with(prefix) {
                    return Some(handler.clone());
                }
            }
        }

        self.handlers.get("*").cloned()
    }

    pub fn spawn(mut self, config: JobExecutorConfig) -> JobExecutorHandle {
        self.lease_timeout = config.lease_timeout;
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let join = tokio::spawn(executor_loop(
            Arc::new(self),
            config,
            shutdown.clone(),
            stats.clone(),
        ));

        JobExecutorHandle {
            shutdown,
            join,
            stats,
            started: Instant::now(),
        }
    }

    /// Run one attempt of an already leased job and store the outcome.
    pub async fn execute_one(&self, job: Job) -> Result<AttemptOutcome, JobStoreError> {
        let started = Utc::now();

        let stop_heartbeat = CancellationToken::new();
        tokio::spawn(keep_lease(
            self.store.clone(),
            job.id.clone(),
            heartbeat_interval(self.lease_timeout),
            stop_heartbeat.clone(),
        ));
        let _lease = stop_heartbeat.drop_guard();

        let result = match self.get_handler(&job.name) {
            Some(handler) => {
                let attempt = job.clone();
                // Run in its own task so a panicking handler fails the attempt
                // instead of the executor.
                match tokio::spawn(async move { handler.handle(attempt).await }).await {
                    Ok(result) => result,
                    Err(e) => JobResult::Failure(format!("job handler panicked: {e}")),
                }
            }
            None => {
                warn!(job_id = %job.id, name = %job.name, "no handler for job");
                JobResult::Failure(format!("no handler for job `{}`", job.name))
            }
        };

        // Reload: the handler may have written progress while it ran.
        let Some(mut current) = self.store.get(&job.id).await? else {
            warn!(job_id = %job.id, "job disappeared while running");
            return Ok(AttemptOutcome::Gone);
        };

        let outcome = match result {
            JobResult::Success => {
                current.mark_completed(started);
                AttemptOutcome::Completed
            }
            JobResult::Failure(error) => {
                current.mark_failed(error, started);
                failure_outcome(&current)
            }
            JobResult::Cancelled(reason) => {
                debug!(job_id = %current.id, reason = %reason, "job cancelled by handler");
                current.mark_cancelled();
                AttemptOutcome::Cancelled
            }
        };

        self.store.update(&current).await?;

        match (&outcome, &current.status) {
            (AttemptOutcome::Completed, _) => {
                debug!(job_id = %current.id, "job completed");
                for listener in &self.listeners {
                    listener.on_completed(&current).await;
                }
            }
            (AttemptOutcome::Retrying, JobStatus::Delayed { error, attempt }) => {
                info!(
                    job_id = %current.id,
                    attempt,
                    max_attempts = current.retry_policy.max_attempts,
                    error = %error,
                    "job attempt failed, retry scheduled"
                );
            }
            (AttemptOutcome::Failed, JobStatus::Failed { error, attempts }) => {
                warn!(job_id = %current.id, attempts, error = %error, "job failed");
                for listener in &self.listeners {
                    listener.on_failed(&current, error).await;
                }
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Take back jobs of `queue` abandoned by dead workers. Jobs that used up
    /// their attempts this way are reported to the listeners as failed.
    pub async fn recover_expired_leases(&self, queue: &str) -> Result<usize, JobStoreError> {
        let recovered = self.store.recover_expired(queue, self.lease_timeout).await?;
        for job in &recovered {
            match &job.status {
                JobStatus::Failed { error, attempts } => {
                    warn!(job_id = %job.id, attempts, error = %error, "abandoned job failed");
                    for listener in &self.listeners {
                        listener.on_failed(job, error).await;
                    }
                }
                _ => {
                    warn!(job_id = %job.id, attempt = job.attempt, "abandoned job requeued");
                }
            }
        }
        if !recovered.is_empty() {
            self.notify.notify_one();
        }
        Ok(recovered.len())
    }
}

/// Refresh the lease of a running job until `stop` fires or the job leaves `active`.
async fn keep_lease(
    store: Arc<dyn JobStore>,
    job_id: JobId,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.heartbeat(&job_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to extend job lease"),
        }
    }
}

fn failure_outcome(job: &Job) -> AttemptOutcome {
    if matches!(job.status, JobStatus::Failed { .. }) {
        AttemptOutcome::Failed
    } else {
        AttemptOutcome::Retrying
    }
}

async fn executor_loop(
    executor: Arc<JobExecutor>,
    config: JobExecutorConfig,
    shutdown: CancellationToken,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(
        executor = %config.name,
        queue = %config.queue,
        max_concurrent = config.max_concurrent,
        "job executor started"
    );

    let permits = Arc::new(Semaphore::new(config.max_concurrent));
    let sweep_every = heartbeat_interval(config.lease_timeout);
    let mut last_sweep: Option<Instant> = None;

    loop {
        if last_sweep.is_none_or(|at| at.elapsed() >= sweep_every) {
            last_sweep = Some(Instant::now());
            if let Err(e) = executor.recover_expired_leases(&config.queue).await {
                error!(executor = %config.name, error = %e, "failed to recover expired leases");
            }
        }

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        match executor.store.claim_next(&config.queue).await {
            Ok(Some(job)) => {
                debug!(executor = %config.name, job_id = %job.id, attempt = job.attempt, "claimed job");
                lock(&stats).current_running += 1;

                let executor = executor.clone();
                let stats = stats.clone();
                let name = config.name.clone();
                tokio::spawn(async move {
                    let job_id = job.id.clone();
                    let outcome = executor.execute_one(job).await;
                    drop(permit);

                    let mut s = lock(&stats);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                    match outcome {
                        Ok(AttemptOutcome::Completed) => s.jobs_succeeded += 1,
                        Ok(AttemptOutcome::Retrying) => s.jobs_retried += 1,
                        Ok(AttemptOutcome::Failed) => s.jobs_failed += 1,
                        Ok(AttemptOutcome::Cancelled) => s.jobs_cancelled += 1,
                        Ok(AttemptOutcome::Gone) => {}
                        Err(e) => {
                            error!(executor = %name, job_id = %job_id, error = %e, "failed to record job outcome");
                        }
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = executor.notify.notified() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(executor = %config.name, error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    // Drain: every permit back means no attempt is still running.
    let in_flight = config.max_concurrent as u32;
    if permits.acquire_many(in_flight).await.is_err() {
        warn!(executor = %config.name, "semaphore closed during shutdown");
    }

    info!(executor = %config.name, "job executor stopped");
}
