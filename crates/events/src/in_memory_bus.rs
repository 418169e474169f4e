//! In-memory event bus for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoned by a panicking publisher.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out per channel
/// - Dead subscribers are pruned while publishing and on every subscribe
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    channels: Mutex<HashMap<String, Vec<UnboundedSender<M>>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `channel` as of the last publish.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|c| {
                c.get(channel)
                    .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            })
            .unwrap_or(0)
    }

    /// Number of channels with at least one registered subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Drop closed senders and the channels left without any.
fn prune<M>(channels: &mut HashMap<String, Vec<UnboundedSender<M>>>) {
    channels.retain(|_, subs| {
        subs.retain(|tx| !tx.is_closed());
        !subs.is_empty()
    });
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    async fn publish(&self, channel: &str, message: M) -> Result<usize, Self::Error> {
        let mut channels = self.channels.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let Some(subs) = channels.get_mut(channel) else {
            return Ok(0);
        };

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        if delivered == 0 {
            channels.remove(channel);
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription<M>, Self::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.channels.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        prune(&mut channels);
        channels.entry(channel.to_string()).or_default().push(tx);

        Ok(Subscription::new(rx))
    }
}
