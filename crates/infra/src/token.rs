//! Permission-preloading tokens.
//!
//! A token embeds the user's (optionally compressed) permission snapshot, the
//! content hash of the full snapshot, and the user's roles. Embedded grants
//! cannot be revoked by invalidation; expiry is their only revocation path,
//! hence the short validity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use warden_core::{TenantId, UserId, WardenError, WardenResult};
use warden_policy::{PermissionClaims, TokenValidationError, compress, validate_claims};

use crate::pipeline::PermissionPipeline;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub validity: Duration,
    pub compression: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret".to_string(),
            issuer: "warden-iam".to_string(),
            validity: Duration::from_secs(900),
            compression: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token encoding failed: {0}")]
    Encode(String),

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

impl From<TokenError> for WardenError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Encode(msg) => WardenError::Validation(msg),
            other => WardenError::Unauthorized(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
    pub perms_hash: String,
    pub compressed: bool,
    /// Resource patterns before and after compression.
    pub original_entries: usize,
    pub embedded_entries: usize,
}

pub struct TokenIssuer {
    pipeline: Arc<PermissionPipeline>,
    config: TokenConfig,
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(pipeline: Arc<PermissionPipeline>, config: TokenConfig) -> Self {
        Self {
            key: EncodingKey::from_secret(config.secret.as_bytes()),
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[instrument(skip(self), fields(user = %user, tenant = %tenant), err)]
    pub async fn issue(&self, user: &UserId, tenant: &TenantId) -> WardenResult<IssuedToken> {
        let snapshot = self.pipeline.get_user_permissions(user, tenant).await?;
        let perms_hash = snapshot.content_hash();

        let original_entries = snapshot.permissions.len();
        let perms = if self.config.compression {
            compress(&snapshot.permissions)
        } else {
            snapshot.permissions.clone()
        };
        let embedded_entries = perms.len();
        if self.config.compression {
            debug!(
                before = original_entries,
                after = embedded_entries,
                saved = original_entries - embedded_entries,
                "permission map compressed"
            );
        }

        let iat = Utc::now().timestamp();
        let exp = iat + self.config.validity.as_secs().max(1) as i64;
        let claims = PermissionClaims {
            sub: user.clone(),
            iss: self.config.issuer.clone(),
            tenant_id: tenant.clone(),
            roles: snapshot.roles.clone(),
            perms,
            perms_compressed: self.config.compression,
            perms_hash: perms_hash.clone(),
            iat,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| TokenError::Encode(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_at: exp,
            perms_hash,
            compressed: self.config.compression,
            original_entries,
            embedded_entries,
        })
    }

    /// Re-issues for the token's subject from the current snapshot.
    pub async fn refresh(&self, claims: &PermissionClaims) -> WardenResult<IssuedToken> {
        self.issue(&claims.sub, &claims.tenant_id).await
    }
}

/// Verifies signature, issuer and time window of permission tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &TokenConfig) -> Self {
        Self::new(&config.secret, &config.issuer)
    }

    pub fn verify(&self, token: &str) -> Result<PermissionClaims, TokenError> {
        let data = jsonwebtoken::decode::<PermissionClaims>(token, &self.key, &self.validation)
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        validate_claims(&data.claims, Utc::now().timestamp())?;
        Ok(data.claims)
    }
}
