//! In-process Progress Store for dev/tests and single-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use canopy_analysis::{ProgressEvent, ProgressRecord, ResultsRecord};
use canopy_core::AnalysisId;
use canopy_events::{EventBus, InMemoryEventBus, Subscription};

use super::{CacheError, ProgressStore, keys};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// TTL key-value map plus an in-memory bus.
///
/// Values are stored serialized, the way the Redis store keeps them, so
/// both implementations share the same encoding paths.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<String, Entry>>,
    bus: InMemoryEventBus<ProgressEvent>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn put<T: Serialize + ?Sized>(
        &self,
        key: String,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_string(value)?;
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(serde_json::from_str(&e.value)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get_progress(&self, id: AnalysisId) -> Result<Option<ProgressRecord>, CacheError> {
        self.read(&keys::progress(id)).await
    }

    async fn set_progress(&self, record: &ProgressRecord, ttl: Duration) -> Result<(), CacheError> {
        self.put(keys::progress(record.analysis_id), record, ttl).await
    }

    async fn get_results(&self, id: AnalysisId) -> Result<Option<ResultsRecord>, CacheError> {
        self.read(&keys::results(id)).await
    }

    async fn set_results(
        &self,
        id: AnalysisId,
        results: &ResultsRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put(keys::results(id), results, ttl).await
    }

    async fn set_cancel_flag(&self, id: AnalysisId, ttl: Duration) -> Result<(), CacheError> {
        self.put(keys::cancel(id), "1", ttl).await
    }

    async fn clear_cancel_flag(&self, id: AnalysisId) -> Result<(), CacheError> {
        self.entries.write().await.remove(&keys::cancel(id));
        Ok(())
    }

    async fn is_cancelled(&self, id: AnalysisId) -> Result<bool, CacheError> {
        Ok(self.read::<String>(&keys::cancel(id)).await?.is_some())
    }

    async fn publish(&self, event: &ProgressEvent) -> Result<usize, CacheError> {
        self.bus
            .publish(&keys::events(event.analysis_id()), event.clone())
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, id: AnalysisId) -> Result<Subscription<ProgressEvent>, CacheError> {
        self.bus
            .subscribe(&keys::events(id))
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_analysis::{ProgressUpdate, Stage};
    use chrono::Utc;

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn progress_round_trips() {
        let store = InMemoryProgressStore::new();
        let id = AnalysisId::new();
        let mut record = ProgressRecord::queued(id, Utc::now());
        record
            .apply(ProgressUpdate::new(Stage::TreeDetection, 50.0, "trees"), Utc::now())
            .unwrap();

        store.set_progress(&record, DAY).await.unwrap();
        assert_eq!(store.get_progress(id).await.unwrap(), Some(record));
        assert!(store.get_progress(AnalysisId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryProgressStore::new();
        let id = AnalysisId::new();
        store
            .set_progress(&ProgressRecord::queued(id, Utc::now()), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(store.get_progress(id).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get_progress(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_flag_lifecycle() {
        let store = InMemoryProgressStore::new();
        let id = AnalysisId::new();

        assert!(!store.is_cancelled(id).await.unwrap());
        store.set_cancel_flag(id, DAY).await.unwrap();
        assert!(store.is_cancelled(id).await.unwrap());
        store.clear_cancel_flag(id).await.unwrap();
        assert!(!store.is_cancelled(id).await.unwrap());
    }

    #[tokio::test]
    async fn events_reach_only_their_analysis() {
        let store = InMemoryProgressStore::new();
        let watched = AnalysisId::new();
        let mut sub = store.subscribe(watched).await.unwrap();

        let other = ProgressRecord::queued(AnalysisId::new(), Utc::now());
        assert_eq!(store.publish(&ProgressEvent::progress(&other)).await.unwrap(), 0);

        let mine = ProgressRecord::queued(watched, Utc::now());
        assert_eq!(store.publish(&ProgressEvent::progress(&mine)).await.unwrap(), 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.analysis_id(), watched);
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn finished_subscriptions_do_not_accumulate() {
        let store = InMemoryProgressStore::new();
        for _ in 0..1000 {
            drop(store.subscribe(AnalysisId::new()).await.unwrap());
        }

        let _live = store.subscribe(AnalysisId::new()).await.unwrap();
        assert_eq!(store.bus.channel_count(), 1);
    }
}
