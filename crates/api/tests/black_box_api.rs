use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

use warden_api::app::{AppServices, build_app};
use warden_core::{RoleId, TenantId, UserId};
use warden_infra::WardenConfig;
use warden_policy::{InMemoryPolicyStore, PermissionClaims, PermissionMap, PolicyEngine};

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(seed: impl FnOnce(&PolicyEngine)) -> Self {
        Self::spawn_with(test_config(), seed).await
    }

    async fn spawn_with(config: WardenConfig, seed: impl FnOnce(&PolicyEngine)) -> Self {
        let services = AppServices::in_memory(config, Arc::new(InMemoryPolicyStore::new()))
            .await
            .expect("failed to wire services");
        seed(&services.engine);
        let services = Arc::new(services);
        services.bus.start();

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client.get(self.url(path)).bearer_auth(token).send().await.unwrap()
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn test_config() -> WardenConfig {
    WardenConfig {
        jwt_secret: SECRET.to_string(),
        ..WardenConfig::default()
    }
}

fn mint_jwt(user: &str, tenant: &str, roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = PermissionClaims {
        sub: UserId::new(user),
        iss: "warden-iam".into(),
        tenant_id: TenantId::new(tenant),
        roles: roles.iter().map(|r| RoleId::new(*r)).collect::<BTreeSet<_>>(),
        perms: PermissionMap::new(),
        perms_compressed: false,
        perms_hash: String::new(),
        iat: now,
        exp: now + 600,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

/// acme: EDITOR may read and update documents; alice is an EDITOR; root
/// holds WARDEN_ADMIN, which may do anything in acme.
fn seed_acme(engine: &PolicyEngine) {
    let acme = TenantId::new("acme");
    let editor = RoleId::new("EDITOR");
    let admin = RoleId::new("WARDEN_ADMIN");

    engine.add_policy(&editor, &acme, "/api/docs/*", "GET|PUT").unwrap();
    engine.add_policy(&admin, &acme, "*", "*").unwrap();
    engine.add_grouping("alice", &editor, &acme).unwrap();
    engine.add_grouping("root", &admin, &acme).unwrap();
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn(|_| {}).await;
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn(|_| {}).await;

    let res = srv.client.get(srv.url("/whoami")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv.get("/whoami", "not-a-jwt").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn tenant_context_is_derived_from_token() {
    let srv = TestServer::spawn(|_| {}).await;
    let token = mint_jwt("alice", "acme", &["EDITOR"]);

    let res = srv.get("/whoami", &token).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["tenant_id"], "acme");
    assert_eq!(body["user_id"], "alice");
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "EDITOR"));
}

#[tokio::test]
async fn resource_access_follows_policies() {
    let srv = TestServer::spawn(seed_acme).await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);

    let res = srv
        .client
        .get(srv.url("/api/docs/42"))
        .bearer_auth(&alice)
        .header("x-user-id", "root")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["path"], "/api/docs/42");
    assert_eq!(body["forwarded"]["user_id"], "alice");
    assert_eq!(body["forwarded"]["tenant_id"], "acme");
    assert!(body["forwarded"]["authorization"].is_null());

    let res = srv
        .client
        .delete(srv.url("/api/docs/42"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // One level only.
    let res = srv.get("/api/docs/42/history", &alice).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // Same user name in another tenant holds nothing.
    let elsewhere = mint_jwt("alice", "globex", &["EDITOR"]);
    let res = srv.get("/api/docs/42", &elsewhere).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn deny_policy_overrides_allow() {
    let srv = TestServer::spawn(|engine| {
        seed_acme(engine);
        engine
            .add_deny_policy(&RoleId::new("EDITOR"), &TenantId::new("acme"), "/api/docs/payroll", "GET")
            .unwrap();
    })
    .await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);

    assert_eq!(srv.get("/api/docs/42", &alice).await.status(), StatusCode::OK);
    assert_eq!(srv.get("/api/docs/payroll", &alice).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_routes_are_guarded() {
    let srv = TestServer::spawn(seed_acme).await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);

    let res = srv.get("/admin/cache/stats", &alice).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);
    let res = srv.get("/admin/cache/stats", &root).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert!(body["total_checks"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn revoking_a_role_takes_effect_on_the_next_request() {
    let srv = TestServer::spawn(seed_acme).await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);

    assert_eq!(srv.get("/api/docs/1", &alice).await.status(), StatusCode::OK);
    // Let the detached L2 write land so the stale decision is really cached.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let res = srv
        .client
        .delete(srv.url("/admin/roles/EDITOR/members/alice"))
        .bearer_auth(&root)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["revoked"], true);

    assert_eq!(srv.get("/api/docs/1", &alice).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn role_inheritance_is_managed_over_http() {
    let srv = TestServer::spawn(|engine| {
        seed_acme(engine);
        engine
            .add_grouping("carol", &RoleId::new("MANAGER"), &TenantId::new("acme"))
            .unwrap();
    })
    .await;
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);
    let carol = mint_jwt("carol", "acme", &["MANAGER"]);

    assert_eq!(srv.get("/api/docs/9", &carol).await.status(), StatusCode::FORBIDDEN);

    let res = srv
        .post("/admin/hierarchy", &root, json!({ "child": "MANAGER", "parent": "EDITOR" }))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let change: Value = res.json().await.unwrap();
    assert_eq!(change["changed"], true);
    assert_eq!(change["edge"]["level"], 1);

    assert_eq!(srv.get("/api/docs/9", &carol).await.status(), StatusCode::OK);

    let res = srv
        .post("/admin/hierarchy", &root, json!({ "child": "EDITOR", "parent": "MANAGER" }))
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "circular_dependency");

    let res = srv.get("/admin/hierarchy", &root).await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["edges"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_role_policies_replaces_the_role_grants() {
    let srv = TestServer::spawn(seed_acme).await;
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);

    let res = srv
        .client
        .put(srv.url("/admin/roles/EDITOR/policies"))
        .bearer_auth(&root)
        .json(&json!({
            "grants": [
                { "resource": "/api/reports/*", "canRead": true, "canExport": true }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["policies"], 1);

    assert_eq!(srv.get("/api/reports/q3", &alice).await.status(), StatusCode::OK);
    assert_eq!(srv.get("/api/docs/1", &alice).await.status(), StatusCode::FORBIDDEN);

    let res = srv
        .get("/admin/check?user=alice&resource=/api/reports/q3&action=EXPORT", &root)
        .await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["allowed"], true);
}

#[tokio::test]
async fn capacity_ceiling_rejects_additions() {
    let mut config = test_config();
    config.thresholds.max_per_role = 1;
    let srv = TestServer::spawn_with(config, |engine| {
        engine
            .add_policy(&RoleId::new("WARDEN_ADMIN"), &TenantId::new("acme"), "*", "*")
            .unwrap();
        engine
            .add_grouping("root", &RoleId::new("WARDEN_ADMIN"), &TenantId::new("acme"))
            .unwrap();
    })
    .await;
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);

    let policy = json!({ "role": "AUDITOR", "resource": "/api/audit/*", "action": "GET" });
    assert_eq!(srv.post("/admin/policies", &root, policy).await.status(), StatusCode::OK);

    let res = srv.get("/admin/capacity?role=AUDITOR&count=1", &root).await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["allowed"], false);

    let policy = json!({ "role": "AUDITOR", "resource": "/api/logs/*", "action": "GET" });
    let res = srv.post("/admin/policies", &root, policy).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "capacity_exceeded");
}

#[tokio::test]
async fn issued_tokens_carry_the_permission_hash() {
    let srv = TestServer::spawn(seed_acme).await;
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);

    let res = srv.post("/admin/tokens", &root, json!({ "user": "alice" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let issued: Value = res.json().await.unwrap();
    let token = issued["token"].as_str().unwrap().to_string();

    let res = srv.get("/whoami", &token).await;
    assert_eq!(res.status(), StatusCode::OK);
    let whoami: Value = res.json().await.unwrap();
    assert_eq!(whoami["user_id"], "alice");
    assert_eq!(whoami["perms_hash"], issued["perms_hash"]);

    let res = srv.get("/permissions/me", &token).await;
    let perms: Value = res.json().await.unwrap();
    assert_eq!(perms["stale"], false);
    assert!(perms["permissions"]["/api/docs/*"].is_array());

    // A hand-minted token carries no hash, so it reads as stale.
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);
    let perms: Value = srv.get("/permissions/me", &alice).await.json().await.unwrap();
    assert_eq!(perms["stale"], true);
}

#[tokio::test]
async fn repeated_reads_are_served_from_the_response_cache() {
    let srv = TestServer::spawn(seed_acme).await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);

    let first = srv.get("/api/docs/7?view=full", &alice).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "MISS");

    let second = srv.get("/api/docs/7?view=full", &alice).await;
    assert_eq!(second.headers()["x-cache"], "HIT");

    // Other callers never see alice's cached body.
    let root = mint_jwt("root", "acme", &["WARDEN_ADMIN"]);
    let third = srv.get("/api/docs/7?view=full", &root).await;
    assert_eq!(third.headers()["x-cache"], "MISS");
}

#[tokio::test]
async fn rate_limit_applies_per_user() {
    let mut config = test_config();
    config.rate_burst = 2;
    config.rate_replenish = 1;
    let srv = TestServer::spawn_with(config, |_| {}).await;
    let alice = mint_jwt("alice", "acme", &["EDITOR"]);
    let bob = mint_jwt("bob", "acme", &["EDITOR"]);

    let first = srv.get("/whoami", &alice).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(srv.get("/whoami", &alice).await.status(), StatusCode::OK);

    let limited = srv.get("/whoami", &alice).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));

    assert_eq!(srv.get("/whoami", &bob).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn bootstrap_admin_can_use_the_admin_surface_of_a_fresh_deployment() {
    let config = WardenConfig {
        bootstrap_admin: Some((TenantId::new("acme"), UserId::new("ops"))),
        ..test_config()
    };
    let srv = TestServer::spawn_with(config, |_| {}).await;

    let ops = mint_jwt("ops", "acme", &[]);
    assert_eq!(srv.get("/admin/policies", &ops).await.status(), StatusCode::OK);

    let stranger = mint_jwt("eve", "acme", &[]);
    assert_eq!(srv.get("/admin/policies", &stranger).await.status(), StatusCode::FORBIDDEN);

    let other_tenant = mint_jwt("ops", "globex", &[]);
    assert_eq!(srv.get("/admin/policies", &other_tenant).await.status(), StatusCode::FORBIDDEN);
}
