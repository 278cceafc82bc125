use std::collections::BTreeSet;

use warden_core::{RoleId, TenantId, UserId};

/// Tenant context for a request.
///
/// Derived from a verified token; never from client-supplied headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Principal context for a request (verified identity, roles and the hash of
/// the permission snapshot the token was issued with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    roles: BTreeSet<RoleId>,
    perms_hash: String,
    expires_at: i64,
}

impl PrincipalContext {
    pub fn new(user_id: UserId, roles: BTreeSet<RoleId>, perms_hash: String, expires_at: i64) -> Self {
        Self {
            user_id,
            roles,
            perms_hash,
            expires_at,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn roles(&self) -> &BTreeSet<RoleId> {
        &self.roles
    }

    pub fn perms_hash(&self) -> &str {
        &self.perms_hash
    }

    /// Unix seconds.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }
}
