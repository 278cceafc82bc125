//! Edge filters, outermost first:
//!
//! 1. `auth`: verifies the bearer token and rewrites identity headers.
//! 2. `rate_limit`: token bucket per user (or client address).
//! 3. `permission`: consults the permission pipeline for (path, method).
//! 4. `response_cache`: serves repeated safe reads from memory.
//! 5. `coalesce`: merges concurrent identical cache misses.

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, StatusCode},
    response::Response,
};

use crate::context::{PrincipalContext, TenantContext};

pub mod auth;
pub mod coalesce;
pub mod permission;
pub mod rate_limit;
pub mod response_cache;

pub use auth::{AuthState, auth_middleware};
pub use coalesce::{Coalescer, coalesce_middleware};
pub use permission::permission_guard;
pub use rate_limit::{RateLimiter, rate_limit_middleware};
pub use response_cache::{ResponseCache, response_cache_middleware};

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_TENANT_ID: HeaderName = HeaderName::from_static("x-tenant-id");
pub const X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");
pub const X_PERMISSIONS_HASH: HeaderName = HeaderName::from_static("x-permissions-hash");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_COALESCED: HeaderName = HeaderName::from_static("x-coalesced");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Cap on bodies buffered by the response cache and the coalescer.
pub const MAX_BUFFERED_BODY: usize = 4 * 1024 * 1024;

/// A fully buffered response that can be replayed any number of times.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    pub async fn capture(res: Response) -> Result<Self, axum::Error> {
        let (parts, body) = res.into_parts();
        let body = axum::body::to_bytes(body, MAX_BUFFERED_BODY).await?;
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn replay(&self) -> Response {
        let mut res = Response::new(Body::from(self.body.clone()));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers.clone();
        res
    }
}

/// `{tenant}:{user}:{METHOD} {path?query}`. Replayed bodies are partitioned
/// per principal so one caller's response is never served to another.
pub fn request_key(req: &Request) -> String {
    let ext = req.extensions();
    let tenant = ext
        .get::<TenantContext>()
        .map(|t| t.tenant_id().as_str())
        .unwrap_or("-");
    let user = ext
        .get::<PrincipalContext>()
        .map(|p| p.user_id().as_str())
        .unwrap_or("-");
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path());
    format!("{tenant}:{user}:{} {target}", req.method())
}
