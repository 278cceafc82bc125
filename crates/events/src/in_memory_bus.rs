//! In-memory event bus for tests/dev.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("bus lock poisoned")]
    Poisoned,

    /// A failure requested through `fail_next`.
    #[error("injected transport failure")]
    Injected,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out; dead subscribers are dropped while publishing
/// - `fail_next(n)` makes the next `n` publishes fail, for retry tests
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<M>>>,
    published: Mutex<Vec<String>>,
    failures: AtomicU32,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Channels of every successful publish, in order.
    pub fn published_channels(&self) -> Vec<String> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = InMemoryBusError;

    async fn publish(&self, channel: &str, message: &M) -> Result<(), Self::Error> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(InMemoryBusError::Injected);
        }

        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        drop(subs);

        if let Ok(mut published) = self.published.lock() {
            published.push(channel.to_string());
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_a_copy() {
        let bus = InMemoryEventBus::<u32>::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("chan", &7).await.unwrap();

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
        assert_eq!(bus.published_channels(), vec!["chan".to_string()]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let bus = InMemoryEventBus::<u32>::new();
        bus.fail_next(2);
        assert_eq!(bus.publish("c", &1).await, Err(InMemoryBusError::Injected));
        assert_eq!(bus.publish("c", &1).await, Err(InMemoryBusError::Injected));
        assert_eq!(bus.publish("c", &1).await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        drop(bus.subscribe());
        bus.publish("c", &1).await.unwrap();
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
