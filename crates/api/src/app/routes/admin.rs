//! Administrative routes.
//!
//! Tenant-scoped operations act on the caller's tenant as carried by the
//! verified token. Reload, full cache clear and growth stats are fleet-wide;
//! grant `/admin/...` paths accordingly.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;

use warden_core::{Effect, RoleId, UserId};
use warden_infra::ResourceGrant;

use crate::app::errors::{parse_id, warden_error_to_response};
use crate::app::services::AppServices;
use crate::context::TenantContext;

type Handled = Result<Response, Response>;

fn ok(body: serde_json::Value) -> Handled {
    Ok((StatusCode::OK, Json(body)).into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Request DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub role: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub effect: Effect,
}

#[derive(Debug, Deserialize)]
pub struct SyncRolePoliciesRequest {
    pub grants: Vec<ResourceGrant>,
}

#[derive(Debug, Deserialize)]
pub struct MemberRequest {
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct InheritanceRequest {
    pub child: String,
    pub parent: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub user: String,
    pub resource: String,
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct CapacityQuery {
    pub role: String,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub user: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/policies", get(list_policies).post(add_policy))
        .route("/policies/remove", post(remove_policy))
        .route("/policies/reload", post(reload_policies))
        .route("/roles/:role/policies", axum::routing::put(sync_role_policies))
        .route("/roles/:role/members", post(assign_role))
        .route("/roles/:role/members/:user", delete(revoke_role))
        .route("/hierarchy", get(get_hierarchy).post(add_inheritance))
        .route("/hierarchy/remove", post(remove_inheritance))
        .route("/check", get(check_permission))
        .route("/capacity", get(validate_capacity))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/clear/tenant", post(clear_tenant_cache))
        .route("/cache/clear/users/:user", post(clear_user_cache))
        .route("/cache/clear/roles/:role", post(clear_role_cache))
        .route("/growth", get(growth_stats))
        .route("/invalidation/stats", get(invalidation_stats))
        .route("/tokens", post(issue_token))
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/policies - policies and groupings of the caller's tenant
pub async fn list_policies(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Handled {
    let mut listing = services.admin.all_policies();
    listing.policies.retain(|p| &p.domain == tenant.tenant_id());
    listing.groupings.retain(|g| &g.domain == tenant.tenant_id());
    ok(json!(listing))
}

/// POST /admin/policies
pub async fn add_policy(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<PolicyRequest>,
) -> Handled {
    let role: RoleId = parse_id(&body.role)?;
    let added = services
        .admin
        .add_policy(&role, tenant.tenant_id(), &body.resource, &body.action, body.effect)
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "added": added }))
}

/// POST /admin/policies/remove
pub async fn remove_policy(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<PolicyRequest>,
) -> Handled {
    let role: RoleId = parse_id(&body.role)?;
    let removed = services
        .admin
        .remove_policy(&role, tenant.tenant_id(), &body.resource, &body.action)
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "removed": removed }))
}

/// POST /admin/policies/reload - reload every domain from the store
pub async fn reload_policies(Extension(services): Extension<Arc<AppServices>>) -> Handled {
    services
        .admin
        .reload_all()
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "reloaded": true }))
}

/// PUT /admin/roles/:role/policies - replace the role's policies with `grants`
pub async fn sync_role_policies(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(role): Path<String>,
    Json(body): Json<SyncRolePoliciesRequest>,
) -> Handled {
    let role: RoleId = parse_id(&role)?;
    let policies = services
        .admin
        .sync_role_policies(&role, tenant.tenant_id(), &body.grants)
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "role": role, "policies": policies }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Roles & hierarchy
// ─────────────────────────────────────────────────────────────────────────────

/// POST /admin/roles/:role/members
pub async fn assign_role(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(role): Path<String>,
    Json(body): Json<MemberRequest>,
) -> Handled {
    let role: RoleId = parse_id(&role)?;
    let user: UserId = parse_id(&body.user)?;
    let assigned = services
        .admin
        .assign_role(&user, &role, tenant.tenant_id())
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "assigned": assigned }))
}

/// DELETE /admin/roles/:role/members/:user
pub async fn revoke_role(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path((role, user)): Path<(String, String)>,
) -> Handled {
    let role: RoleId = parse_id(&role)?;
    let user: UserId = parse_id(&user)?;
    let revoked = services
        .admin
        .revoke_role(&user, &role, tenant.tenant_id())
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({ "revoked": revoked }))
}

/// GET /admin/hierarchy
pub async fn get_hierarchy(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Handled {
    ok(json!({ "edges": services.admin.hierarchy(tenant.tenant_id()) }))
}

/// POST /admin/hierarchy - `child` inherits every permission of `parent`
pub async fn add_inheritance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<InheritanceRequest>,
) -> Handled {
    let child: RoleId = parse_id(&body.child)?;
    let parent: RoleId = parse_id(&body.parent)?;
    let change = services
        .admin
        .add_role_inheritance(&child, &parent, tenant.tenant_id())
        .await
        .map_err(warden_error_to_response)?;
    ok(json!(change))
}

/// POST /admin/hierarchy/remove
pub async fn remove_inheritance(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<InheritanceRequest>,
) -> Handled {
    let child: RoleId = parse_id(&body.child)?;
    let parent: RoleId = parse_id(&body.parent)?;
    let change = services
        .admin
        .remove_role_inheritance(&child, &parent, tenant.tenant_id())
        .await
        .map_err(warden_error_to_response)?;
    ok(json!(change))
}

// ─────────────────────────────────────────────────────────────────────────────
// Checks & capacity
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/check?user=&resource=&action=
pub async fn check_permission(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<CheckQuery>,
) -> Handled {
    let user: UserId = parse_id(&query.user)?;
    let decision = services
        .admin
        .check_permission(&user, tenant.tenant_id(), &query.resource, &query.action)
        .await
        .map_err(warden_error_to_response)?;
    ok(json!({
        "allowed": decision.allowed,
        "tier": decision.tier,
    }))
}

/// GET /admin/capacity?role=&count=
pub async fn validate_capacity(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<CapacityQuery>,
) -> Handled {
    let role: RoleId = parse_id(&query.role)?;
    ok(json!(services.admin.validate_can_add(tenant.tenant_id(), &role, query.count)))
}

/// GET /admin/growth - scans now
pub async fn growth_stats(Extension(services): Extension<Arc<AppServices>>) -> Handled {
    let stats = services
        .admin
        .growth_stats()
        .await
        .map_err(warden_error_to_response)?;
    ok(json!(stats))
}

// ─────────────────────────────────────────────────────────────────────────────
// Caches & invalidation
// ─────────────────────────────────────────────────────────────────────────────

pub async fn cache_stats(Extension(services): Extension<Arc<AppServices>>) -> Handled {
    ok(json!(services.admin.cache_stats()))
}

pub async fn clear_cache(Extension(services): Extension<Arc<AppServices>>) -> Handled {
    services.admin.clear_cache().await;
    ok(json!({ "cleared": "all" }))
}

pub async fn clear_tenant_cache(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> Handled {
    services.admin.clear_cache_for_tenant(tenant.tenant_id()).await;
    ok(json!({ "cleared": "tenant", "tenant_id": tenant.tenant_id() }))
}

pub async fn clear_user_cache(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(user): Path<String>,
) -> Handled {
    let user: UserId = parse_id(&user)?;
    services
        .admin
        .clear_cache_for_user(&user, Some(tenant.tenant_id()))
        .await;
    ok(json!({ "cleared": "user", "user_id": user }))
}

pub async fn clear_role_cache(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(role): Path<String>,
) -> Handled {
    let role: RoleId = parse_id(&role)?;
    services
        .admin
        .clear_cache_for_role(&role, Some(tenant.tenant_id()))
        .await;
    ok(json!({ "cleared": "role", "role_id": role }))
}

pub async fn invalidation_stats(Extension(services): Extension<Arc<AppServices>>) -> Handled {
    ok(json!(services.admin.invalidation_stats()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

/// POST /admin/tokens - issue a permission-preloading token for a user of
/// the caller's tenant
pub async fn issue_token(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<IssueTokenRequest>,
) -> Handled {
    let user: UserId = parse_id(&body.user)?;
    let issued = services
        .admin
        .issue_token(&user, tenant.tenant_id())
        .await
        .map_err(warden_error_to_response)?;
    ok(json!(issued))
}
