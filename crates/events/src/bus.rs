//! Event publishing/subscription abstraction (mechanics only).
//!
//! Messages are published on named channels. Every live subscription of a
//! channel receives its own copy (broadcast semantics). Delivery is
//! best-effort: nothing is persisted, and a subscriber that is not connected
//! when a message is published never sees it. Consumers that need the latest
//! state read it from the owning store and treat the bus as a wake-up signal.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};
use tokio_stream::Stream;
use tokio_util::sync::DropGuard;

/// A subscription to one channel.
///
/// Dropping the subscription unsubscribes: the bus notices the closed
/// receiver on its next publish, and any background forwarder tied to the
/// subscription is stopped.
///
/// ```ignore
/// let mut sub = bus.subscribe("analysis:events:42").await?;
/// while let Some(event) = sub.recv().await {
///     handle(event);
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
    _guard: Option<DropGuard>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self {
            receiver,
            _guard: None,
        }
    }

    /// Subscription whose forwarder task is cancelled when it is dropped.
    pub fn with_guard(receiver: UnboundedReceiver<M>, guard: DropGuard) -> Self {
        Self {
            receiver,
            _guard: Some(guard),
        }
    }

    /// Wait for the next message. `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl<M> Stream for Subscription<M> {
    type Item = M;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Domain-agnostic, channel-keyed event bus.
///
/// `publish` returns the number of subscribers the message was handed to.
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, channel: &str, message: M) -> Result<usize, Self::Error>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription<M>, Self::Error>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, channel: &str, message: M) -> Result<usize, Self::Error> {
        (**self).publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription<M>, Self::Error> {
        (**self).subscribe(channel).await
    }
}
