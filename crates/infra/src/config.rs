//! Runtime configuration, read once from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: `{value}` ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Where the processing service reads inputs and writes outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "local".to_string(),
            bucket: None,
            base_path: Some("./uploads".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub service_url: String,
    pub request_timeout: Duration,
    /// Public base URL the processing service calls back on.
    pub callback_base_url: String,
    /// Shared secret expected in `x-callback-token`, if any.
    pub callback_token: Option<String>,
    pub storage: StorageConfig,
}

impl ProcessingSettings {
    pub fn callback_url(&self) -> String {
        format!(
            "{}/pipeline/callback",
            self.callback_base_url.trim_end_matches('/')
        )
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8000".to_string(),
            request_timeout: Duration::from_secs(3600),
            callback_base_url: "http://localhost:8080".to_string(),
            callback_token: None,
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Run the job executor inside the API process.
    pub embedded: bool,
    /// How often an active run re-reads the cancellation flag.
    pub cancel_poll_interval: Duration,
    /// Active jobs silent for this long belong to a dead worker and are retried.
    pub lease_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            embedded: true,
            cancel_poll_interval: Duration::from_secs(2),
            lease_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(5000),
        }
    }
}

/// Cache lifetimes.
#[derive(Debug, Clone, Copy)]
pub struct TtlSettings {
    pub progress: Duration,
    pub results: Duration,
    pub cancel: Duration,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            progress: Duration::from_secs(24 * 60 * 60),
            results: Duration::from_secs(7 * 24 * 60 * 60),
            cancel: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanopyConfig {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub processing: ProcessingSettings,
    pub worker: WorkerSettings,
    pub jobs: JobSettings,
    pub ttl: TtlSettings,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: None,
            processing: ProcessingSettings::default(),
            worker: WorkerSettings::default(),
            jobs: JobSettings::default(),
            ttl: TtlSettings::default(),
        }
    }
}

impl CanopyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let processing = ProcessingSettings {
            service_url: env.string("PROCESSING_SERVICE_URL", defaults.processing.service_url),
            request_timeout: env.secs(
                "PROCESSING_TIMEOUT_SECS",
                defaults.processing.request_timeout,
            )?,
            callback_base_url: env.string(
                "CALLBACK_BASE_URL",
                defaults.processing.callback_base_url,
            ),
            callback_token: env.optional("CALLBACK_TOKEN"),
            storage: StorageConfig {
                storage_type: env.string("STORAGE_TYPE", defaults.processing.storage.storage_type),
                bucket: env.optional("STORAGE_BUCKET"),
                base_path: env
                    .optional("STORAGE_BASE_PATH")
                    .or(defaults.processing.storage.base_path),
            },
        };

        let worker = WorkerSettings {
            concurrency: env.parse("WORKER_CONCURRENCY", defaults.worker.concurrency)?,
            poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", defaults.worker.poll_interval)?,
            embedded: env.parse("EMBEDDED_WORKER", defaults.worker.embedded)?,
            cancel_poll_interval: env.millis(
                "CANCEL_POLL_INTERVAL_MS",
                defaults.worker.cancel_poll_interval,
            )?,
            lease_timeout: env.secs("JOB_LEASE_TIMEOUT_SECS", defaults.worker.lease_timeout)?,
        };
        if worker.lease_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "JOB_LEASE_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let config = Self {
            bind_addr: env.parse("BIND_ADDR", defaults.bind_addr)?,
            use_persistent_stores: env.parse("USE_PERSISTENT_STORES", false)?,
            database_url: env.optional("DATABASE_URL"),
            redis_url: env.optional("REDIS_URL"),
            processing,
            worker,
            jobs: JobSettings {
                attempts: env.parse("JOB_ATTEMPTS", defaults.jobs.attempts)?,
                backoff: env.millis("JOB_BACKOFF_MS", defaults.jobs.backoff)?,
            },
            ttl: TtlSettings {
                progress: env.secs("PROGRESS_TTL_SECS", defaults.ttl.progress)?,
                results: env.secs("RESULTS_TTL_SECS", defaults.ttl.results)?,
                cancel: env.secs("CANCEL_TTL_SECS", defaults.ttl.cancel)?,
            },
        };

        if config.use_persistent_stores && config.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(config)
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: String) -> String {
        self.optional(name).unwrap_or(default)
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
