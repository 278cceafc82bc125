//! Cache invalidation events and their channel routing.
//!
//! Events travel as JSON with camelCase field names:
//! `{type, userId, tenantId, roleId, resource, reason, timestamp, eventId}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warden_core::{RoleId, TenantId, UserId};

/// General channel: permission-level and wildcard events.
pub const CHANNEL_GENERAL: &str = "cache:invalidation";
/// Role and resource changes.
pub const CHANNEL_PERMISSION_CHANGE: &str = "cache:permission:change";
pub const CHANNEL_USER_CHANGE: &str = "cache:user:change";
pub const CHANNEL_TENANT_CHANGE: &str = "cache:tenant:change";

pub const ALL_CHANNELS: [&str; 4] = [
    CHANNEL_GENERAL,
    CHANNEL_PERMISSION_CHANGE,
    CHANNEL_USER_CHANGE,
    CHANNEL_TENANT_CHANGE,
];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationType {
    User,
    Tenant,
    Role,
    Resource,
    Permission,
    Wildcard,
}

impl InvalidationType {
    pub fn channel(&self) -> &'static str {
        match self {
            InvalidationType::User => CHANNEL_USER_CHANGE,
            InvalidationType::Tenant => CHANNEL_TENANT_CHANGE,
            InvalidationType::Role | InvalidationType::Resource => CHANNEL_PERMISSION_CHANGE,
            InvalidationType::Permission | InvalidationType::Wildcard => CHANNEL_GENERAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    #[serde(rename = "type")]
    pub kind: InvalidationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<RoleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Only set on PERMISSION events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
    /// Instance that published the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationEvent {
    fn new(kind: InvalidationType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            user_id: None,
            tenant_id: None,
            role_id: None,
            resource: None,
            action: None,
            reason: reason.into(),
            timestamp: Utc::now(),
            event_id: Uuid::now_v7(),
            origin: None,
        }
    }

    pub fn user(user: UserId, tenant: Option<TenantId>, reason: impl Into<String>) -> Self {
        Self {
            user_id: Some(user),
            tenant_id: tenant,
            ..Self::new(InvalidationType::User, reason)
        }
    }

    pub fn tenant(tenant: TenantId, reason: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant),
            ..Self::new(InvalidationType::Tenant, reason)
        }
    }

    pub fn role(role: RoleId, tenant: Option<TenantId>, reason: impl Into<String>) -> Self {
        Self {
            role_id: Some(role),
            tenant_id: tenant,
            ..Self::new(InvalidationType::Role, reason)
        }
    }

    pub fn resource(resource: impl Into<String>, tenant: Option<TenantId>, reason: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            tenant_id: tenant,
            ..Self::new(InvalidationType::Resource, reason)
        }
    }

    pub fn permission(
        user: UserId,
        tenant: TenantId,
        resource: impl Into<String>,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            user_id: Some(user),
            tenant_id: Some(tenant),
            resource: Some(resource.into()),
            action: Some(action.into()),
            ..Self::new(InvalidationType::Permission, reason)
        }
    }

    pub fn wildcard(reason: impl Into<String>) -> Self {
        Self::new(InvalidationType::Wildcard, reason)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn channel(&self) -> &'static str {
        self.kind.channel()
    }
}
