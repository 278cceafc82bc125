//! Message publishing/subscription abstraction (mechanics only).
//!
//! The bus is a lightweight pub/sub transport:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, etc.
//! - **At-least-once delivery**: a message may arrive more than once, so
//!   consumers must be idempotent.
//! - **No ordering guarantees** across publishers.
//! - **No persistence**: the bus distributes; the policy store is the source
//!   of truth.
//!
//! Messages are published on a named channel. Subscribers receive messages
//! from every channel through one subscription, so a single handler path
//! consumes them all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// A subscription to the bus.
///
/// ```ignore
/// let mut subscription = bus.subscribe();
/// while let Some(message) = subscription.recv().await {
///     handle(message).await;
/// }
/// ```
///
/// Each subscription gets a copy of every published message (broadcast
/// semantics). `recv` returns `None` once the bus side is gone.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout`; `None` on timeout or when the bus is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<M> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Domain-agnostic pub/sub bus.
///
/// `publish()` can fail (transport down, serialization error). Failures are
/// surfaced to the caller, which owns the retry policy.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, channel: &str, message: &M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + Sync + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, channel: &str, message: &M) -> Result<(), Self::Error> {
        (**self).publish(channel, message).await
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
