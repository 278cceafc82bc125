//! Resource routes under `/api`.
//!
//! Downstream services are not part of this binary; this handler reflects
//! each request exactly as the edge would forward it, identity headers
//! included, so deployments can verify the filter chain end to end.

use axum::{
    Json,
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

use crate::middleware::{X_PERMISSIONS_HASH, X_TENANT_ID, X_USER_ID, X_USER_ROLES};

fn header(headers: &HeaderMap, name: &axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub async fn forward(req: Request) -> impl IntoResponse {
    let headers = req.headers();
    (
        StatusCode::OK,
        Json(json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "query": req.uri().query(),
            "forwarded": {
                "user_id": header(headers, &X_USER_ID),
                "tenant_id": header(headers, &X_TENANT_ID),
                "roles": header(headers, &X_USER_ROLES),
                "perms_hash": header(headers, &X_PERMISSIONS_HASH),
                "authorization": header(headers, &axum::http::header::AUTHORIZATION),
            },
        })),
    )
}
