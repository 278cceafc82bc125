//! Cache tiers.
//!
//! - `local`: the process-local `TtlCache` used for L1 permission checks,
//!   snapshots, response bodies and event de-duplication.
//! - `DistributedCache`: the shared L2 tier (in-memory for tests/dev, Redis
//!   behind the `redis` feature).
//!
//! Every shared key lives under a namespace so prefix eviction in one cache
//! can never touch another's keys.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use warden_core::{TenantId, UserId, WardenError};

pub mod local;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use local::TtlCache;
pub use memory::InMemoryDistributedCache;
#[cfg(feature = "redis")]
pub use redis::RedisDistributedCache;

pub const PERMISSION_NAMESPACE: &str = "warden:perm";
pub const SNAPSHOT_NAMESPACE: &str = "warden:snapshot";
pub const RATE_LIMIT_NAMESPACE: &str = "warden:ratelimit";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cached value is malformed: {0}")]
    Malformed(String),
}

impl From<CacheError> for WardenError {
    fn from(value: CacheError) -> Self {
        WardenError::cache_unavailable(value.to_string())
    }
}

/// Shared TTL-based cache. Values are strings; callers own the encoding.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Deletes every key starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// Key of one cached permission decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionKey {
    pub tenant: TenantId,
    pub user: UserId,
    pub resource: String,
    /// Uppercase; action matching is case-insensitive.
    pub action: String,
}

impl PermissionKey {
    pub fn new(user: &UserId, tenant: &TenantId, resource: &str, action: &str) -> Self {
        Self {
            tenant: tenant.clone(),
            user: user.clone(),
            resource: resource.to_string(),
            action: warden_policy::matcher::normalize_action(action),
        }
    }

    /// Resource goes last since it may itself contain `:`.
    pub fn shared_key(&self) -> String {
        format!(
            "{PERMISSION_NAMESPACE}:{}:{}:{}:{}",
            self.tenant, self.user, self.action, self.resource
        )
    }
}

/// Key of one cached permission snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub tenant: TenantId,
    pub user: UserId,
}

impl SnapshotKey {
    pub fn new(user: &UserId, tenant: &TenantId) -> Self {
        Self {
            tenant: tenant.clone(),
            user: user.clone(),
        }
    }

    pub fn shared_key(&self) -> String {
        format!("{SNAPSHOT_NAMESPACE}:{}:{}", self.tenant, self.user)
    }
}

/// Shared-key prefix covering one user's permission decisions in a tenant.
pub fn user_permission_prefix(tenant: &TenantId, user: &UserId) -> String {
    format!("{PERMISSION_NAMESPACE}:{tenant}:{user}:")
}

pub fn tenant_permission_prefix(tenant: &TenantId) -> String {
    format!("{PERMISSION_NAMESPACE}:{tenant}:")
}

pub fn tenant_snapshot_prefix(tenant: &TenantId) -> String {
    format!("{SNAPSHOT_NAMESPACE}:{tenant}:")
}
