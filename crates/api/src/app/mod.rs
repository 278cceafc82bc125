//! HTTP application wiring (Axum router + edge filter chain).
//!
//! - `services.rs`: component wiring (store, engine, caches, bus, issuer)
//! - `routes/`: HTTP handlers, one file per area
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, middleware::from_fn_with_state, routing::get};

use crate::middleware::{
    AuthState, Coalescer, RateLimiter, ResponseCache, auth_middleware, coalesce_middleware,
    permission_guard, rate_limit_middleware, response_cache_middleware,
};

pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

const RESPONSE_CACHE_ENTRIES: usize = 10_000;

/// Build the full HTTP router.
///
/// Filters run outermost first: auth, rate limit, permission guard, then
/// (for `/api` only) the response cache and coalescing of cache misses.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let config = &services.config;
    let auth_state = AuthState {
        verifier: services.verifier.clone(),
    };
    let limiter = Arc::new(RateLimiter::new(
        services.pipeline.shared_cache().clone(),
        config.rate_replenish,
        config.rate_burst,
    ));
    let coalescer = Arc::new(Coalescer::new(
        &config.coalesce_methods,
        config.coalesce_window,
        config.coalesce_max_wait,
    ));
    let response_cache = Arc::new(ResponseCache::new(RESPONSE_CACHE_ENTRIES, config.response_ttl));

    let resources = routes::resources()
        .layer(from_fn_with_state(coalescer, coalesce_middleware))
        .layer(from_fn_with_state(response_cache, response_cache_middleware));

    let guarded = routes::admin()
        .merge(resources)
        .layer(from_fn_with_state(services.pipeline.clone(), permission_guard));

    let protected = routes::self_service()
        .merge(guarded)
        .layer(Extension(services.clone()))
        .layer(from_fn_with_state(limiter, rate_limit_middleware))
        .layer(from_fn_with_state(auth_state, auth_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
