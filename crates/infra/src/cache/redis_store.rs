//! Redis-backed Progress Store.
//!
//! Plain keys with `PX` expiry for records and flags, `PUBLISH`/`SUBSCRIBE`
//! for events. Redis pub/sub is not durable: subscribers that are offline
//! miss events and recover through the progress snapshot.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use canopy_analysis::{ProgressEvent, ProgressRecord, ResultsRecord};
use canopy_core::AnalysisId;
use canopy_events::Subscription;

use super::{CacheError, ProgressStore, keys};

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

#[derive(Clone)]
pub struct RedisProgressStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProgressStore").finish_non_exhaustive()
    }
}

impl RedisProgressStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    async fn put<T: Serialize + ?Sized>(
        &self,
        key: String,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let millis = ttl.as_millis().max(1) as u64;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("PX")
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(CacheError::from))
            .transpose()
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn get_progress(&self, id: AnalysisId) -> Result<Option<ProgressRecord>, CacheError> {
        self.read(keys::progress(id)).await
    }

    async fn set_progress(&self, record: &ProgressRecord, ttl: Duration) -> Result<(), CacheError> {
        self.put(keys::progress(record.analysis_id), record, ttl).await
    }

    async fn get_results(&self, id: AnalysisId) -> Result<Option<ResultsRecord>, CacheError> {
        self.read(keys::results(id)).await
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
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys::cancel(id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_cancelled(&self, id: AnalysisId) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(keys::cancel(id))
            .query_async(&mut conn)
            .await?;
        Ok(exists > 0)
    }

    async fn publish(&self, event: &ProgressEvent) -> Result<usize, CacheError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(keys::events(event.analysis_id()))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, id: AnalysisId) -> Result<Subscription<ProgressEvent>, CacheError> {
        let channel = keys::events(id);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        // Forwarder task; ends when the subscription is dropped or the connection closes.
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                let msg = tokio::select! {
                    _ = stopped.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "unreadable pub/sub payload");
                        continue;
                    }
                };

                let event: ProgressEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable progress event");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "pub/sub forwarder stopped");
        });

        Ok(Subscription::with_guard(rx, stop.drop_guard()))
    }
}
