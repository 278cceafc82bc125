use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use warden_infra::TokenVerifier;
use warden_policy::PermissionClaims;

use super::{X_PERMISSIONS_HASH, X_TENANT_ID, X_USER_ID, X_USER_ROLES};
use crate::app::errors::json_error;
use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<TokenVerifier>,
}

/// Verifies the bearer token, replaces any client-supplied identity headers
/// with trusted ones and drops the credential before the request moves on.
pub async fn auth_middleware(State(state): State<AuthState>, mut req: Request, next: Next) -> Result<Response, Response> {
    let claims = {
        let token = extract_bearer(req.headers())
            .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token"))?;
        state.verifier.verify(token).map_err(|e| {
            debug!(error = %e, "token rejected");
            json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string())
        })?
    };

    let headers = req.headers_mut();
    strip_identity_headers(headers);
    headers.remove(header::AUTHORIZATION);
    attach_identity_headers(headers, &claims)
        .map_err(|_| json_error(StatusCode::UNAUTHORIZED, "unauthorized", "identity is not header-safe"))?;

    req.extensions_mut()
        .insert(TenantContext::new(claims.tenant_id.clone()));
    req.extensions_mut().insert(PrincipalContext::new(
        claims.sub,
        claims.roles,
        claims.perms_hash,
        claims.exp,
    ));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    (!token.is_empty()).then_some(token)
}

fn is_identity_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.starts_with("x-user-") || name == X_TENANT_ID.as_str() || name == X_PERMISSIONS_HASH.as_str()
}

fn strip_identity_headers(headers: &mut HeaderMap) {
    let spoofed: Vec<HeaderName> = headers.keys().filter(|n| is_identity_header(n)).cloned().collect();
    for name in spoofed {
        headers.remove(&name);
    }
}

fn attach_identity_headers(
    headers: &mut HeaderMap,
    claims: &PermissionClaims,
) -> Result<(), axum::http::header::InvalidHeaderValue> {
    let roles = claims
        .roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(",");

    headers.insert(X_USER_ID, HeaderValue::from_str(claims.sub.as_str())?);
    headers.insert(X_TENANT_ID, HeaderValue::from_str(claims.tenant_id.as_str())?);
    headers.insert(X_USER_ROLES, HeaderValue::from_str(&roles)?);
    headers.insert(X_PERMISSIONS_HASH, HeaderValue::from_str(&claims.perms_hash)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, body::Body, middleware::from_fn_with_state, routing::get};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::test_support::{SECRET, mint_token};

    async fn echo_headers(headers: HeaderMap) -> Json<Value> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Json(json!({
            "user": get("x-user-id"),
            "tenant": get("x-tenant-id"),
            "roles": get("x-user-roles"),
            "hash": get("x-permissions-hash"),
            "department": get("x-user-department"),
            "authorization": get("authorization"),
        }))
    }

    fn app() -> Router {
        let state = AuthState {
            verifier: Arc::new(TokenVerifier::new(SECRET, "warden-iam")),
        };
        Router::new()
            .route("/echo", get(echo_headers))
            .layer(from_fn_with_state(state, auth_middleware))
    }

    async fn body_json(res: Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let res = app()
            .oneshot(axum::http::Request::builder().uri("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_signed_with_another_key_is_rejected() {
        let token = mint_token("some-other-secret", "alice", "acme", &["EDITOR"]);
        let res = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/echo")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trusted_headers_replace_spoofed_ones() {
        let token = mint_token(SECRET, "alice", "acme", &["EDITOR", "VIEWER"]);
        let res = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/echo")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header("x-user-id", "mallory")
                    .header("x-tenant-id", "other")
                    .header("x-user-department", "finance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = body_json(res).await;
        assert_eq!(body["user"], "alice");
        assert_eq!(body["tenant"], "acme");
        assert_eq!(body["roles"], "EDITOR,VIEWER");
        assert_eq!(body["hash"], "test-hash");
        assert!(body["department"].is_null());
        assert!(body["authorization"].is_null());
    }
}
