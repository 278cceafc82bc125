//! Cache invalidation fan-out.
//!
//! Publishing retries with capped exponential backoff; exhausting the retries
//! is a security-relevant failure (stale grants may survive on other
//! instances) and is logged as such. Delivery is at-least-once, so received
//! events are de-duplicated by id before the handlers run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use warden_core::{WardenError, WardenResult};
use warden_events::{EventBus, InvalidationEvent, Subscription};
use warden_policy::PolicyEngine;

use crate::cache::TtlCache;
use crate::pipeline::PermissionPipeline;
use crate::workers::BlockingPool;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Reacts to a received invalidation event. Must be idempotent.
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &InvalidationEvent) -> WardenResult<()>;
}

#[async_trait]
trait Transport: Send + Sync {
    async fn send(&self, channel: &str, event: &InvalidationEvent) -> Result<(), BoxError>;

    fn listen(&self) -> Subscription<InvalidationEvent>;
}

#[async_trait]
impl<B> Transport for B
where
    B: EventBus<InvalidationEvent>,
{
    async fn send(&self, channel: &str, event: &InvalidationEvent) -> Result<(), BoxError> {
        self.publish(channel, event).await.map_err(Into::into)
    }

    fn listen(&self) -> Subscription<InvalidationEvent> {
        self.subscribe()
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    retries: AtomicU64,
    delivery_failures: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    handled: AtomicU64,
    handler_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidationStats {
    pub instance_id: String,
    pub published: u64,
    pub retries: u64,
    pub delivery_failures: u64,
    pub received: u64,
    pub duplicates: u64,
    /// Events whose handlers have all run.
    pub handled: u64,
    pub handler_errors: u64,
    pub handlers: usize,
}

pub struct InvalidationBus {
    transport: Arc<dyn Transport>,
    instance_id: String,
    retry: RetryPolicy,
    handlers: RwLock<Vec<Arc<dyn InvalidationHandler>>>,
    seen: TtlCache<Uuid, ()>,
    counters: Counters,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBus {
    pub fn new<B>(transport: B, instance_id: impl Into<String>) -> Self
    where
        B: EventBus<InvalidationEvent> + 'static,
    {
        Self {
            transport: Arc::new(transport),
            instance_id: instance_id.into(),
            retry: RetryPolicy::default(),
            handlers: RwLock::new(Vec::new()),
            seen: TtlCache::new(10_000, Duration::from_secs(300)),
            counters: Counters::default(),
            listener: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Handlers run in registration order.
    pub fn register(&self, handler: Arc<dyn InvalidationHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(handler);
        }
    }

    /// Publishes on the event's channel, stamping this instance as origin.
    #[instrument(skip(self, event), fields(kind = ?event.kind, event_id = %event.event_id), err)]
    pub async fn publish(&self, event: InvalidationEvent) -> WardenResult<()> {
        let event = match event.origin {
            Some(_) => event,
            None => event.with_origin(self.instance_id.clone()),
        };
        let channel = event.channel();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.send(channel, &event).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    debug!(channel, attempt, "invalidation published");
                    return Ok(());
                }
                Err(e) if attempt <= self.retry.max_retries => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.backoff(attempt);
                    warn!(channel, attempt, error = %e, delay_ms = delay.as_millis() as u64, "invalidation publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        critical = true,
                        security = true,
                        channel,
                        attempts = attempt,
                        event_id = %event.event_id,
                        tenant_id = ?event.tenant_id,
                        user_id = ?event.user_id,
                        error = %e,
                        "invalidation delivery failed, other instances may serve stale permissions"
                    );
                    return Err(WardenError::InvalidationDeliveryFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Publishes every event, even after a failure. Returns the number
    /// delivered, or the last failure.
    pub async fn publish_batch(&self, events: Vec<InvalidationEvent>) -> WardenResult<usize> {
        let mut delivered = 0;
        let mut last_err = None;
        for event in events {
            match self.publish(event).await {
                Ok(()) => delivered += 1,
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Fire-and-forget publish; failures are logged by `publish`.
    pub fn publish_detached(self: &Arc<Self>, event: InvalidationEvent) {
        let bus = self.clone();
        tokio::spawn(async move {
            let _ = bus.publish(event).await;
        });
    }

    /// Runs the handlers for an event not seen before. Returns whether it ran.
    pub async fn dispatch(&self, event: &InvalidationEvent) -> bool {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if self.seen.contains(&event.event_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, "duplicate invalidation ignored");
            return false;
        }
        self.seen.insert(event.event_id, ());

        let handlers = self.handlers.read().map(|h| h.clone()).unwrap_or_default();
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(handler = handler.name(), event_id = %event.event_id, error = %e, "invalidation handler failed");
            }
        }
        self.counters.handled.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Subscribes to the transport and dispatches received events until
    /// `shutdown`.
    pub fn start(self: &Arc<Self>) {
        let mut subscription = self.transport.listen();
        let bus = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                bus.dispatch(&event).await;
            }
            warn!("invalidation subscription closed");
        });

        if let Ok(mut listener) = self.listener.lock() {
            if let Some(previous) = listener.replace(task) {
                previous.abort();
            }
        }
        info!(instance_id = %self.instance_id, "invalidation listener started");
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.listener.lock().ok().and_then(|mut l| l.take()) {
            task.abort();
        }
    }

    pub fn stats(&self) -> InvalidationStats {
        let c = &self.counters;
        InvalidationStats {
            instance_id: self.instance_id.clone(),
            published: c.published.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            handled: c.handled.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            handlers: self.handlers.read().map(|h| h.len()).unwrap_or(0),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Drops the local cache entries an event covers.
pub struct CacheEvictionHandler {
    pipeline: Arc<PermissionPipeline>,
}

impl CacheEvictionHandler {
    pub fn new(pipeline: Arc<PermissionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl InvalidationHandler for CacheEvictionHandler {
    fn name(&self) -> &'static str {
        "cache-eviction"
    }

    async fn handle(&self, event: &InvalidationEvent) -> WardenResult<()> {
        let evicted = self.pipeline.evict(event);
        debug!(kind = ?event.kind, evicted, "local cache entries evicted");
        Ok(())
    }
}

/// Reloads this instance's policy model when another instance changed it.
/// Register before `CacheEvictionHandler` so evicted entries are recomputed
/// from the refreshed model.
pub struct EngineRefreshHandler {
    engine: Arc<PolicyEngine>,
    pool: Arc<BlockingPool>,
    instance_id: String,
}

impl EngineRefreshHandler {
    pub fn new(engine: Arc<PolicyEngine>, pool: Arc<BlockingPool>, instance_id: impl Into<String>) -> Self {
        Self {
            engine,
            pool,
            instance_id: instance_id.into(),
        }
    }
}

#[async_trait]
impl InvalidationHandler for EngineRefreshHandler {
    fn name(&self) -> &'static str {
        "engine-refresh"
    }

    async fn handle(&self, event: &InvalidationEvent) -> WardenResult<()> {
        if event.origin.as_deref().is_none_or(|origin| origin == self.instance_id) {
            return Ok(());
        }

        let engine = self.engine.clone();
        match event.tenant_id.clone() {
            Some(tenant) => {
                debug!(tenant_id = %tenant, origin = ?event.origin, "reloading domain after remote change");
                self.pool.run(move || engine.reload_domain(&tenant)).await?
            }
            None => {
                debug!(origin = ?event.origin, "reloading policy model after remote change");
                self.pool.run(move || engine.reload()).await?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use warden_core::{TenantId, UserId};
    use warden_events::InMemoryEventBus;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl InvalidationHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _event: &InvalidationEvent) -> WardenResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn user_event() -> InvalidationEvent {
        InvalidationEvent::user(UserId::new("alice"), Some(TenantId::new("t1")), "role revoked")
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn publish_recovers_from_transient_failures() {
        let transport: Arc<InMemoryEventBus<InvalidationEvent>> = Arc::new(InMemoryEventBus::new());
        transport.fail_next(2);
        let bus = InvalidationBus::new(transport.clone(), "node-a").with_retry(fast_retry());

        bus.publish(user_event()).await.unwrap();

        assert_eq!(transport.published_channels(), vec!["cache:user:change".to_string()]);
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn third_retry_is_still_attempted() {
        let transport: Arc<InMemoryEventBus<InvalidationEvent>> = Arc::new(InMemoryEventBus::new());
        transport.fail_next(3);
        let bus = InvalidationBus::new(transport.clone(), "node-a").with_retry(fast_retry());

        bus.publish(InvalidationEvent::wildcard("reload")).await.unwrap();

        assert_eq!(transport.published_channels().len(), 1);
        assert_eq!(bus.stats().retries, 3);
        assert_eq!(bus.stats().delivery_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_delivery_failure() {
        let transport: Arc<InMemoryEventBus<InvalidationEvent>> = Arc::new(InMemoryEventBus::new());
        transport.fail_next(4);
        let bus = InvalidationBus::new(transport.clone(), "node-a").with_retry(fast_retry());

        let err = bus.publish(user_event()).await.unwrap_err();

        assert!(matches!(err, WardenError::InvalidationDeliveryFailed { attempts: 4, .. }));
        assert!(transport.published_channels().is_empty());
        assert_eq!(bus.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn duplicate_events_run_handlers_once() {
        let bus = InvalidationBus::new(InMemoryEventBus::new(), "node-a");
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        bus.register(counting.clone());

        let event = user_event();
        assert!(bus.dispatch(&event).await);
        assert!(!bus.dispatch(&event).await);

        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn listener_dispatches_published_events() {
        let bus = Arc::new(InvalidationBus::new(InMemoryEventBus::new(), "node-a"));
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        bus.register(counting.clone());
        bus.start();

        bus.publish(InvalidationEvent::wildcard("test")).await.unwrap();

        for _ in 0..50 {
            if counting.0.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }
}
