use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use warden_core::{RoleId, TenantId, UserId};

use crate::model::PermissionMap;

/// Claims of a permission-preloading token.
///
/// `perms` carries the (possibly compressed) snapshot and `perms_hash` its
/// content hash, so a consumer can compare against a fresh snapshot without
/// retransmitting the map. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionClaims {
    pub sub: UserId,
    pub iss: String,
    pub tenant_id: TenantId,
    pub roles: BTreeSet<RoleId>,
    pub perms: PermissionMap,
    #[serde(default)]
    pub perms_compressed: bool,
    pub perms_hash: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,

    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
}

/// Deterministically validate claims against `now` (Unix seconds).
///
/// Signature verification happens before this, in the transport layer.
pub fn validate_claims(claims: &PermissionClaims, now: i64) -> Result<(), TokenValidationError> {
    if claims.sub.as_str().is_empty() {
        return Err(TokenValidationError::MissingClaim("sub"));
    }
    if claims.tenant_id.as_str().is_empty() {
        return Err(TokenValidationError::MissingClaim("tenant_id"));
    }
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}
