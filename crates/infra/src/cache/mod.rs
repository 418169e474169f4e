//! Progress Store: TTL cache of per-analysis state plus live event fan-out.
//!
//! Key layout:
//!
//! | key | value | default TTL |
//! |---|---|---|
//! | `analysis:progress:<id>` | Progress Record (JSON) | 24h |
//! | `analysis:results:<id>` | Results Record (JSON) | 7d |
//! | `analysis:cancel:<id>` | `"1"` | 1h |
//! | `analysis:events:<id>` | pub/sub channel of `ProgressEvent` | n/a |
//!
//! The cache is never the source of truth. Callers treat every
//! [`CacheError`] as degraded mode: reads fall back to the system of record,
//! failed writes are logged and the pipeline carries on.

use std::time::Duration;

use async_trait::async_trait;

use canopy_analysis::{ProgressEvent, ProgressRecord, ResultsRecord};
use canopy_core::AnalysisId;
use canopy_events::Subscription;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::InMemoryProgressStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisProgressStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

pub mod keys {
    use canopy_core::AnalysisId;

    pub fn progress(id: AnalysisId) -> String {
        format!("analysis:progress:{id}")
    }

    pub fn results(id: AnalysisId) -> String {
        format!("analysis:results:{id}")
    }

    pub fn cancel(id: AnalysisId) -> String {
        format!("analysis:cancel:{id}")
    }

    pub fn events(id: AnalysisId) -> String {
        format!("analysis:events:{id}")
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(&self, id: AnalysisId) -> Result<Option<ProgressRecord>, CacheError>;

    async fn set_progress(&self, record: &ProgressRecord, ttl: Duration) -> Result<(), CacheError>;

    async fn get_results(&self, id: AnalysisId) -> Result<Option<ResultsRecord>, CacheError>;

    async fn set_results(
        &self,
        id: AnalysisId,
        results: &ResultsRecord,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn set_cancel_flag(&self, id: AnalysisId, ttl: Duration) -> Result<(), CacheError>;

    /// Drop a leftover flag so a restarted run is not cancelled by its predecessor.
    async fn clear_cancel_flag(&self, id: AnalysisId) -> Result<(), CacheError>;

    async fn is_cancelled(&self, id: AnalysisId) -> Result<bool, CacheError>;

    /// Publish on the analysis' channel. Returns the number of receivers.
    async fn publish(&self, event: &ProgressEvent) -> Result<usize, CacheError>;

    async fn subscribe(&self, id: AnalysisId) -> Result<Subscription<ProgressEvent>, CacheError>;
}
