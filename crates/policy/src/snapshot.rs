//! Materialized permission snapshots and their compact form.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use warden_core::{RoleId, TenantId, UserId};

use crate::matcher::WILDCARD;
use crate::model::PermissionMap;

/// A user's effective permissions in one tenant. Derived and cached; never
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub roles: BTreeSet<RoleId>,
    pub permissions: PermissionMap,
    pub computed_at: DateTime<Utc>,
}

impl PermissionSnapshot {
    pub fn content_hash(&self) -> String {
        content_hash(&self.permissions)
    }
}

/// Whether a path segment is an instance identifier rather than a collection
/// name: all digits, a hyphenated UUID, or a long hex string.
pub fn is_opaque_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    is_uuid(segment) || (segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_uuid(segment: &str) -> bool {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let parts: Vec<&str> = segment.split('-').collect();
    parts.len() == GROUPS.len()
        && parts
            .iter()
            .zip(GROUPS)
            .all(|(p, len)| p.len() == len && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Replaces opaque segments with `*`.
pub fn collapse_resource(resource: &str) -> String {
    resource
        .split('/')
        .map(|seg| if is_opaque_segment(seg) { WILDCARD } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

/// Collapses opaque path segments and merges the action sets of patterns that
/// collapse to the same key.
pub fn compress(permissions: &PermissionMap) -> PermissionMap {
    let mut out = PermissionMap::new();
    for (resource, actions) in permissions {
        out.entry(collapse_resource(resource))
            .or_default()
            .extend(actions.iter().cloned());
    }
    out
}

/// Hex SHA-256 over `resource:ACTION,ACTION|...` in key order, truncated to
/// 16 characters.
pub fn content_hash(permissions: &PermissionMap) -> String {
    let canonical = permissions
        .iter()
        .map(|(resource, actions)| {
            let joined = actions.iter().map(String::as_str).collect::<Vec<_>>().join(",");
            format!("{resource}:{joined}")
        })
        .collect::<Vec<_>>()
        .join("|");

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}
