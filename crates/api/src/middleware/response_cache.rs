use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use warden_infra::TtlCache;

use super::{BufferedResponse, X_CACHE, request_key};
use crate::app::errors::json_error;

/// TTL-bounded store of `200` responses to `GET`/`HEAD`.
pub struct ResponseCache {
    entries: TtlCache<String, BufferedResponse>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: TtlCache::new(max_entries, ttl),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn is_storable(headers: &HeaderMap) -> bool {
    !headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-store"))
}

pub async fn response_cache_middleware(State(cache): State<Arc<ResponseCache>>, req: Request, next: Next) -> Response {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return next.run(req).await;
    }

    let key = request_key(&req);
    if let Some(hit) = cache.entries.get(&key) {
        let mut res = hit.replay();
        res.headers_mut().insert(X_CACHE, HeaderValue::from_static("HIT"));
        return res;
    }

    let mut res = next.run(req).await;
    if res.status() != StatusCode::OK || !is_storable(res.headers()) {
        res.headers_mut().insert(X_CACHE, HeaderValue::from_static("MISS"));
        return res;
    }

    match BufferedResponse::capture(res).await {
        Ok(buffered) => {
            let mut res = buffered.replay();
            cache.entries.insert(key, buffered);
            res.headers_mut().insert(X_CACHE, HeaderValue::from_static("MISS"));
            res
        }
        Err(e) => {
            warn!(error = %e, "failed to buffer response body");
            json_error(StatusCode::BAD_GATEWAY, "upstream_body_error", "response body could not be read")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        Router,
        body::Body,
        middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    use super::*;

    fn app(cache: Arc<ResponseCache>, calls: Arc<AtomicUsize>) -> Router {
        let counted = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move { format!("call {}", calls.fetch_add(1, Ordering::SeqCst)) }
            }
        };
        let no_store = || async { ([(header::CACHE_CONTROL, "no-store")], "volatile") };
        let missing = || async { (StatusCode::NOT_FOUND, "gone") };

        Router::new()
            .route("/counted", get(counted.clone()).post(counted))
            .route("/volatile", get(no_store))
            .route("/missing", get(missing))
            .layer(from_fn_with_state(cache, response_cache_middleware))
    }

    fn req(method: Method, uri: &str) -> Request {
        axum::http::Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn text(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn repeated_get_is_served_from_cache() {
        let cache = Arc::new(ResponseCache::new(100, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), calls.clone());

        let first = app.clone().oneshot(req(Method::GET, "/counted?page=1")).await.unwrap();
        assert_eq!(first.headers()[&X_CACHE], "MISS");
        assert_eq!(text(first).await, "call 0");

        let second = app.clone().oneshot(req(Method::GET, "/counted?page=1")).await.unwrap();
        assert_eq!(second.headers()[&X_CACHE], "HIT");
        assert_eq!(text(second).await, "call 0");

        // A different query string is a different entry.
        let other = app.oneshot(req(Method::GET, "/counted?page=2")).await.unwrap();
        assert_eq!(other.headers()[&X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn unsafe_methods_bypass_the_cache() {
        let cache = Arc::new(ResponseCache::new(100, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache.clone(), calls.clone());

        for _ in 0..2 {
            let res = app.clone().oneshot(req(Method::POST, "/counted")).await.unwrap();
            assert!(res.headers().get(&X_CACHE).is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn only_storable_200s_are_kept() {
        let cache = Arc::new(ResponseCache::new(100, Duration::from_secs(60)));
        let app = app(cache.clone(), Arc::new(AtomicUsize::new(0)));

        let res = app.clone().oneshot(req(Method::GET, "/missing")).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = app.clone().oneshot(req(Method::GET, "/volatile")).await.unwrap();
        assert_eq!(res.headers()[&X_CACHE], "MISS");
        let res = app.oneshot(req(Method::GET, "/volatile")).await.unwrap();
        assert_eq!(res.headers()[&X_CACHE], "MISS");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = Arc::new(ResponseCache::new(100, Duration::from_millis(20)));
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(cache, calls.clone());

        app.clone().oneshot(req(Method::GET, "/counted")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let res = app.oneshot(req(Method::GET, "/counted")).await.unwrap();
        assert_eq!(res.headers()[&X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
