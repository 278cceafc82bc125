use std::collections::BTreeSet;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use warden_core::{RoleId, TenantId, UserId};
use warden_policy::{PermissionClaims, PermissionMap};

pub const SECRET: &str = "test-secret";

pub fn mint_token(secret: &str, user: &str, tenant: &str, roles: &[&str]) -> String {
    let now = Utc::now().timestamp();
    let claims = PermissionClaims {
        sub: UserId::new(user),
        iss: "warden-iam".into(),
        tenant_id: TenantId::new(tenant),
        roles: roles.iter().map(|r| RoleId::new(*r)).collect::<BTreeSet<_>>(),
        perms: PermissionMap::new(),
        perms_compressed: false,
        perms_hash: "test-hash".into(),
        iat: now,
        exp: now + 600,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to encode jwt")
}
