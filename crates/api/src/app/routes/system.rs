use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::app::errors::warden_error_to_response;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    Json(json!({
        "tenant_id": tenant.tenant_id(),
        "user_id": principal.user_id(),
        "roles": principal.roles(),
        "perms_hash": principal.perms_hash(),
        "expires_at": principal.expires_at(),
    }))
}

/// The caller's current effective permissions. `stale` is set when they no
/// longer match the snapshot embedded in the presented token.
pub async fn my_permissions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    match services
        .pipeline
        .get_user_permissions(principal.user_id(), tenant.tenant_id())
        .await
    {
        Ok(snapshot) => {
            let hash = snapshot.content_hash();
            let stale = hash != principal.perms_hash();
            (
                StatusCode::OK,
                Json(json!({
                    "roles": snapshot.roles,
                    "permissions": snapshot.permissions,
                    "perms_hash": hash,
                    "computed_at": snapshot.computed_at,
                    "stale": stale,
                })),
            )
                .into_response()
        }
        Err(e) => warden_error_to_response(e),
    }
}

/// Re-issues the caller's token from the current snapshot.
pub async fn refresh_token(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    match services.issuer.issue(principal.user_id(), tenant.tenant_id()).await {
        Ok(issued) => (StatusCode::OK, Json(issued)).into_response(),
        Err(e) => warden_error_to_response(e),
    }
}
