use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use warden_infra::PermissionPipeline;

use crate::app::errors::{json_error, warden_error_to_response};
use crate::context::{PrincipalContext, TenantContext};

/// Allows the request only if the caller may perform its method on its path.
///
/// Must run inside `auth_middleware`.
pub async fn permission_guard(
    State(pipeline): State<Arc<PermissionPipeline>>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let (principal, tenant) = match (
        req.extensions().get::<PrincipalContext>(),
        req.extensions().get::<TenantContext>(),
    ) {
        (Some(p), Some(t)) => (p.clone(), t.clone()),
        _ => return Err(json_error(StatusCode::UNAUTHORIZED, "unauthorized", "no authenticated principal")),
    };

    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let allowed = pipeline
        .check_permission(principal.user_id(), tenant.tenant_id(), &path, &method)
        .await
        .map_err(warden_error_to_response)?;

    if !allowed {
        debug!(user = %principal.user_id(), tenant = %tenant.tenant_id(), %path, %method, "request denied");
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!("{method} {path} is not permitted"),
        ));
    }

    Ok(next.run(req).await)
}
