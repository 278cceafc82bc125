//! Token-bucket rate limiting.
//!
//! Bucket state lives in the shared cache under `warden:ratelimit:{key}` so
//! every instance draws from the same bucket. The read-modify-write is not
//! atomic across instances, so a burst racing on several instances can
//! overshoot by at most one token per instance. When the shared cache is
//! unreachable each instance falls back to a local keyed `governor` limiter
//! with the same quota. Keys whose bucket has refilled are pruned from it
//! periodically.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use governor::{
    DefaultKeyedRateLimiter, Quota,
    clock::{Clock, DefaultClock},
};
use tracing::{debug, warn};

use warden_infra::DistributedCache;
use warden_infra::cache::RATE_LIMIT_NAMESPACE;

use super::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
use crate::app::errors::json_error;
use crate::context::{PrincipalContext, TenantContext};

/// Fallback acquisitions between prunes of the local limiter.
const FALLBACK_PRUNE_EVERY: u64 = 1024;

/// Who a request is charged to.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum RateLimitKey {
    User { tenant: String, user: String },
    Ip(IpAddr),
    Anonymous,
}

impl RateLimitKey {
    /// Authenticated user first, then the first `X-Forwarded-For` hop, then
    /// `X-Real-IP`, then the socket address.
    pub fn resolve(req: &Request) -> Self {
        let ext = req.extensions();
        if let (Some(principal), Some(tenant)) = (ext.get::<PrincipalContext>(), ext.get::<TenantContext>()) {
            return Self::User {
                tenant: tenant.tenant_id().to_string(),
                user: principal.user_id().to_string(),
            };
        }

        let header_ip = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        };
        if let Some(ip) = header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip")) {
            return Self::Ip(ip);
        }

        ext.get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Self::Ip(addr.ip()))
            .unwrap_or(Self::Anonymous)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { tenant, user } => write!(f, "user:{tenant}:{user}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `remaining` is unknown when the local fallback decided.
    Allowed { remaining: Option<u32> },
    Limited { retry_after_secs: u64 },
}

/// Persisted bucket state: fractional tokens and the last refill instant.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bucket {
    tokens: f64,
    refilled_at_ms: i64,
}

impl Bucket {
    fn full(burst: u32, now_ms: i64) -> Self {
        Self {
            tokens: f64::from(burst),
            refilled_at_ms: now_ms,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let (tokens, at) = raw.split_once(':')?;
        Some(Self {
            tokens: tokens.parse().ok()?,
            refilled_at_ms: at.parse().ok()?,
        })
    }

    fn encode(&self) -> String {
        format!("{:.6}:{}", self.tokens, self.refilled_at_ms)
    }

    fn take(self, now_ms: i64, per_second: u32, burst: u32) -> (Self, Outcome) {
        let elapsed = (now_ms - self.refilled_at_ms).max(0) as f64 / 1000.0;
        let tokens = (self.tokens + elapsed * f64::from(per_second)).min(f64::from(burst));

        if tokens >= 1.0 {
            let left = tokens - 1.0;
            let next = Self {
                tokens: left,
                refilled_at_ms: now_ms,
            };
            (next, Outcome::Allowed { remaining: Some(left.floor() as u32) })
        } else {
            let wait = ((1.0 - tokens) / f64::from(per_second.max(1))).ceil() as u64;
            let next = Self {
                tokens,
                refilled_at_ms: now_ms,
            };
            (next, Outcome::Limited { retry_after_secs: wait.max(1) })
        }
    }
}

pub struct RateLimiter {
    shared: Arc<dyn DistributedCache>,
    per_second: u32,
    burst: u32,
    state_ttl: Duration,
    fallback: DefaultKeyedRateLimiter<RateLimitKey>,
    fallback_calls: AtomicU64,
}

impl RateLimiter {
    pub fn new(shared: Arc<dyn DistributedCache>, per_second: u32, burst: u32) -> Self {
        let per_second = per_second.max(1);
        let burst = burst.max(1);
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));

        Self {
            shared,
            per_second,
            burst,
            state_ttl: Duration::from_secs(u64::from(burst.div_ceil(per_second)) + 1),
            fallback: governor::RateLimiter::dashmap(quota),
            fallback_calls: AtomicU64::new(0),
        }
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Takes one token from `key`'s bucket.
    pub async fn acquire(&self, key: &RateLimitKey) -> Outcome {
        let cache_key = format!("{RATE_LIMIT_NAMESPACE}:{key}");
        let now = Utc::now().timestamp_millis();

        let current = match self.shared.get(&cache_key).await {
            Ok(raw) => raw
                .as_deref()
                .and_then(Bucket::parse)
                .unwrap_or_else(|| Bucket::full(self.burst, now)),
            Err(e) => {
                warn!(error = %e, "rate limit state unavailable; using local limiter");
                return self.acquire_local(key);
            }
        };

        let (next, outcome) = current.take(now, self.per_second, self.burst);
        if let Err(e) = self.shared.set(&cache_key, &next.encode(), self.state_ttl).await {
            warn!(error = %e, key = %cache_key, "failed to persist rate limit state");
        }
        outcome
    }

    fn acquire_local(&self, key: &RateLimitKey) -> Outcome {
        if self.fallback_calls.fetch_add(1, Ordering::Relaxed) % FALLBACK_PRUNE_EVERY == FALLBACK_PRUNE_EVERY - 1 {
            self.prune_fallback();
        }

        match self.fallback.check_key(key) {
            Ok(()) => Outcome::Allowed { remaining: None },
            Err(not_until) => Outcome::Limited {
                retry_after_secs: not_until
                    .wait_time_from(DefaultClock::default().now())
                    .as_secs()
                    .max(1),
            },
        }
    }

    /// Drops local buckets that have fully refilled; returns how many remain.
    fn prune_fallback(&self) -> usize {
        let before = self.fallback.len();
        self.fallback.retain_recent();
        self.fallback.shrink_to_fit();
        let after = self.fallback.len();
        if before != after {
            debug!(pruned = before - after, remaining = after, "local rate limiter pruned");
        }
        after
    }

    fn decorate(&self, headers: &mut HeaderMap, remaining: Option<u32>) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.burst));
        if let Some(remaining) = remaining {
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
        }
    }
}

pub async fn rate_limit_middleware(State(limiter): State<Arc<RateLimiter>>, req: Request, next: Next) -> Response {
    let key = RateLimitKey::resolve(&req);

    match limiter.acquire(&key).await {
        Outcome::Allowed { remaining } => {
            let mut res = next.run(req).await;
            limiter.decorate(res.headers_mut(), remaining);
            res
        }
        Outcome::Limited { retry_after_secs } => {
            debug!(%key, retry_after_secs, "rate limited");
            let mut res = json_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "too many requests");
            let headers = res.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            limiter.decorate(headers, Some(0));
            res
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, middleware::from_fn_with_state, routing::get};
    use tower::ServiceExt;

    use warden_infra::InMemoryDistributedCache;

    use super::*;

    #[test]
    fn bucket_refills_at_the_configured_rate() {
        let bucket = Bucket::full(2, 0);
        let (bucket, first) = bucket.take(0, 1, 2);
        assert_eq!(first, Outcome::Allowed { remaining: Some(1) });
        let (bucket, second) = bucket.take(0, 1, 2);
        assert_eq!(second, Outcome::Allowed { remaining: Some(0) });
        let (bucket, third) = bucket.take(0, 1, 2);
        assert_eq!(third, Outcome::Limited { retry_after_secs: 1 });

        // One second later a single token is back.
        let (_, fourth) = bucket.take(1_000, 1, 2);
        assert_eq!(fourth, Outcome::Allowed { remaining: Some(0) });
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let (bucket, _) = Bucket::full(3, 0).take(0, 10, 3);
        let (_, outcome) = bucket.take(60_000, 10, 3);
        assert_eq!(outcome, Outcome::Allowed { remaining: Some(2) });
    }

    #[test]
    fn bucket_state_survives_encoding() {
        let bucket = Bucket {
            tokens: 1.25,
            refilled_at_ms: 42,
        };
        assert_eq!(Bucket::parse(&bucket.encode()), Some(bucket));
        assert_eq!(Bucket::parse("garbage"), None);
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(RateLimitKey::resolve(&req), RateLimitKey::Ip("203.0.113.7".parse().unwrap()));

        let req = axum::http::Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(RateLimitKey::resolve(&req), RateLimitKey::Ip("198.51.100.2".parse().unwrap()));
    }

    fn app(shared: Arc<InMemoryDistributedCache>) -> Router {
        let limiter = Arc::new(RateLimiter::new(shared, 1, 2));
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, rate_limit_middleware))
    }

    fn request() -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn third_request_in_a_burst_of_two_is_limited() {
        let shared = Arc::new(InMemoryDistributedCache::new());
        let app = app(shared.clone());

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[&X_RATELIMIT_LIMIT], "2");
        assert_eq!(first.headers()[&X_RATELIMIT_REMAINING], "1");

        let second = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let third = app.oneshot(request()).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(third.headers()[header::RETRY_AFTER], "1");
        assert!(!shared.is_empty());
    }

    #[tokio::test]
    async fn refilled_local_buckets_are_pruned() {
        let shared = Arc::new(InMemoryDistributedCache::new());
        shared.set_unavailable(true);
        let limiter = RateLimiter::new(shared, 1000, 1);

        for last in 1..=3u8 {
            let key = RateLimitKey::Ip(IpAddr::from([203, 0, 113, last]));
            assert_eq!(limiter.acquire(&key).await, Outcome::Allowed { remaining: None });
        }
        assert_eq!(limiter.fallback.len(), 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.prune_fallback(), 0);
    }

    #[tokio::test]
    async fn local_limiter_takes_over_when_cache_is_down() {
        let shared = Arc::new(InMemoryDistributedCache::new());
        shared.set_unavailable(true);
        let app = app(shared);

        for _ in 0..2 {
            let res = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            assert!(res.headers().get(&X_RATELIMIT_REMAINING).is_none());
        }
        let res = app.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
