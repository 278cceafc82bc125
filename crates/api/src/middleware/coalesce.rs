//! Request coalescing.
//!
//! The first request for a key becomes the leader and runs on a detached
//! task, so its result still reaches the followers if the leader's own
//! client goes away. Followers wait up to `max_wait` for that result and
//! then run their own request. A finished result stays joinable for
//! `window` after completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{error, warn};

use super::{BufferedResponse, X_COALESCED, request_key};
use crate::app::errors::json_error;

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(Arc<BufferedResponse>),
    Failed,
}

impl Slot {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

struct InFlight {
    id: u64,
    rx: watch::Receiver<Slot>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceStats {
    pub leaders: u64,
    pub followers: u64,
    pub fallbacks: u64,
}

pub struct Coalescer {
    methods: Vec<Method>,
    window: Duration,
    max_wait: Duration,
    inflight: Arc<DashMap<String, InFlight>>,
    next_id: AtomicU64,
    leaders: AtomicU64,
    followers: AtomicU64,
    fallbacks: AtomicU64,
}

impl Coalescer {
    /// Unknown method names are ignored.
    pub fn new(methods: &[String], window: Duration, max_wait: Duration) -> Self {
        let methods = methods
            .iter()
            .filter_map(|m| Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).ok())
            .collect();

        Self {
            methods,
            window,
            max_wait,
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Keys with a running or recently finished leader.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn stats(&self) -> CoalesceStats {
        CoalesceStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    async fn lead(&self, key: String, id: u64, tx: watch::Sender<Slot>, req: Request, next: Next) -> Response {
        self.leaders.fetch_add(1, Ordering::Relaxed);
        let mut rx = tx.subscribe();
        let inflight = self.inflight.clone();
        let window = self.window;

        tokio::spawn(async move {
            let work = tokio::spawn(async move { BufferedResponse::capture(next.run(req).await).await });
            let slot = match work.await {
                Ok(Ok(buffered)) => Slot::Ready(Arc::new(buffered)),
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to buffer coalesced response");
                    Slot::Failed
                }
                Err(e) => {
                    error!(error = %e, "coalesced request task failed");
                    Slot::Failed
                }
            };
            tx.send_replace(slot);

            if !window.is_zero() {
                tokio::time::sleep(window).await;
            }
            inflight.remove_if(&key, |_, f| f.id == id);
        });

        let slot = rx.wait_for(|s| !s.is_pending()).await.map(|s| (*s).clone());
        match slot {
            Ok(Slot::Ready(buffered)) => buffered.replay(),
            _ => json_error(StatusCode::BAD_GATEWAY, "upstream_failed", "upstream request failed"),
        }
    }

    async fn follow(&self, mut rx: watch::Receiver<Slot>) -> Option<Arc<BufferedResponse>> {
        let waited = tokio::time::timeout(self.max_wait, async move {
            rx.wait_for(|s| !s.is_pending()).await.map(|s| (*s).clone())
        })
        .await;

        match waited {
            Ok(Ok(Slot::Ready(buffered))) => Some(buffered),
            _ => None,
        }
    }
}

enum Role {
    Leader(u64, watch::Sender<Slot>),
    Follower(watch::Receiver<Slot>),
}

pub async fn coalesce_middleware(State(coalescer): State<Arc<Coalescer>>, req: Request, next: Next) -> Response {
    if !coalescer.methods.contains(req.method()) {
        return next.run(req).await;
    }

    let key = request_key(&req);
    let role = match coalescer.inflight.entry(key.clone()) {
        Entry::Occupied(e) => Role::Follower(e.get().rx.clone()),
        Entry::Vacant(v) => {
            let (tx, rx) = watch::channel(Slot::Pending);
            let id = coalescer.next_id.fetch_add(1, Ordering::Relaxed);
            v.insert(InFlight { id, rx });
            Role::Leader(id, tx)
        }
    };

    match role {
        Role::Leader(id, tx) => coalescer.lead(key, id, tx, req, next).await,
        Role::Follower(rx) => match coalescer.follow(rx).await {
            Some(buffered) => {
                coalescer.followers.fetch_add(1, Ordering::Relaxed);
                let mut res = buffered.replay();
                res.headers_mut()
                    .insert(X_COALESCED, HeaderValue::from_static("true"));
                res
            }
            None => {
                coalescer.fallbacks.fetch_add(1, Ordering::Relaxed);
                next.run(req).await
            }
        },
    }
}
