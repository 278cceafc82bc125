use axum::{
    Router,
    routing::{any, get, post},
};

pub mod admin;
pub mod resources;
pub mod system;

/// Routes any authenticated caller may use on their own behalf.
pub fn self_service() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/permissions/me", get(system::my_permissions))
        .route("/auth/refresh", post(system::refresh_token))
}

/// Administrative routes; guarded by path and method.
pub fn admin() -> Router {
    Router::new().nest("/admin", admin::router())
}

/// Resource routes; guarded, coalesced and cached.
pub fn resources() -> Router {
    Router::new().route("/api/*path", any(resources::forward))
}
