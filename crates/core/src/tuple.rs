//! Policy and grouping tuples: the atomic facts the engine evaluates.

use serde::{Deserialize, Serialize};

use crate::id::{RoleId, TenantId};

/// Outcome a matching policy contributes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Effect::Allow),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

/// `(subject_role, domain, resource_pattern, action_pattern, effect)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyTuple {
    pub subject: RoleId,
    pub domain: TenantId,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub effect: Effect,
}

impl PolicyTuple {
    pub fn allow(
        subject: RoleId,
        domain: TenantId,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            domain,
            resource: resource.into(),
            action: action.into(),
            effect: Effect::Allow,
        }
    }

    pub fn deny(
        subject: RoleId,
        domain: TenantId,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow(subject, domain, resource, action)
        }
    }

    /// Uniqueness key; the effect is not part of it.
    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            subject: self.subject.clone(),
            domain: self.domain.clone(),
            resource: self.resource.clone(),
            action: self.action.clone(),
        }
    }
}

/// Identity of a policy tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub subject: RoleId,
    pub domain: TenantId,
    pub resource: String,
    pub action: String,
}

/// Whether a grouping assigns a role to a user or links two roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupingKind {
    #[default]
    UserRole,
    /// `member` is the child role, `role` the parent it inherits from.
    RoleInheritance,
}

/// `(member, role, domain)`: `member` holds every permission of `role` in `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupingTuple {
    pub member: String,
    pub role: RoleId,
    pub domain: TenantId,
    #[serde(default)]
    pub kind: GroupingKind,
}

impl GroupingTuple {
    pub fn user_role(member: impl Into<String>, role: RoleId, domain: TenantId) -> Self {
        Self {
            member: member.into(),
            role,
            domain,
            kind: GroupingKind::UserRole,
        }
    }

    pub fn inheritance(child: RoleId, parent: RoleId, domain: TenantId) -> Self {
        Self {
            member: child.into(),
            role: parent,
            domain,
            kind: GroupingKind::RoleInheritance,
        }
    }

    /// Uniqueness key; the kind is not part of it.
    pub fn key(&self) -> (String, RoleId, TenantId) {
        (self.member.clone(), self.role.clone(), self.domain.clone())
    }
}
