//! Strongly-typed identifiers used across the access-control layer.
//!
//! Identifiers are opaque strings issued by the identity provider; the only
//! validation performed here is that they are non-empty and carry no `:`,
//! which is reserved as the cache-key separator.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Identifier of a tenant (the policy domain / isolation boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

/// Identifier of a user (actor identity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Identifier of a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(String);

macro_rules! impl_str_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw identifier without validation.
            ///
            /// Use `parse()` for values coming from outside the process.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = WardenError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(WardenError::validation(format!("{}: must not be empty", $name)));
                }
                if trimmed.contains(':') {
                    return Err(WardenError::validation(format!(
                        "{}: must not contain ':'",
                        $name
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }
        }
    };
}

impl_str_newtype!(TenantId, "TenantId");
impl_str_newtype!(UserId, "UserId");
impl_str_newtype!(RoleId, "RoleId");
