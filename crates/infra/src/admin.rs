//! Administrative operations.
//!
//! Every mutation persists through the engine on the blocking pool, evicts
//! the shared cache for its scope, runs the local invalidation handlers, and
//! then broadcasts the event on a detached task. A failed broadcast is logged
//! by the bus and never fails the (already committed) mutation.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use warden_core::{Effect, GroupingTuple, PolicyTuple, RoleId, TenantId, UserId, WardenResult};
use warden_events::InvalidationEvent;
use warden_policy::{EdgeChange, PolicyEngine, PolicyGrowthMonitor, PolicyStats, RoleHierarchyEdge, RoleHierarchyManager};

use crate::invalidation::{InvalidationBus, InvalidationStats};
use crate::pipeline::{CacheStats, Decision, PermissionPipeline};
use crate::token::{IssuedToken, TokenIssuer};

/// Menu-style grant flags for one resource, mapped onto HTTP methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrant {
    pub resource: String,
    #[serde(default)]
    pub can_create: bool,
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_update: bool,
    #[serde(default)]
    pub can_delete: bool,
    #[serde(default)]
    pub can_export: bool,
    #[serde(default)]
    pub can_import: bool,
}

impl ResourceGrant {
    /// Alternation pattern for the granted flags, or `None` if nothing is granted.
    pub fn action_pattern(&self) -> Option<String> {
        let mut actions = Vec::new();
        if self.can_read {
            actions.extend(["GET", "HEAD"]);
        }
        if self.can_create {
            actions.push("POST");
        }
        if self.can_update {
            actions.extend(["PUT", "PATCH"]);
        }
        if self.can_delete {
            actions.push("DELETE");
        }
        if self.can_export {
            actions.push("EXPORT");
        }
        if self.can_import {
            actions.push("IMPORT");
        }
        (!actions.is_empty()).then(|| actions.join("|"))
    }
}

/// Role seeded by `bootstrap_admin`.
pub const BOOTSTRAP_ADMIN_ROLE: &str = "WARDEN_ADMIN";

#[derive(Debug, Clone, Serialize)]
pub struct PolicyListing {
    pub policies: Vec<PolicyTuple>,
    pub groupings: Vec<GroupingTuple>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct AdminService {
    engine: Arc<PolicyEngine>,
    hierarchy: Arc<RoleHierarchyManager>,
    pipeline: Arc<PermissionPipeline>,
    bus: Arc<InvalidationBus>,
    monitor: Arc<PolicyGrowthMonitor>,
    issuer: Arc<TokenIssuer>,
}

impl AdminService {
    pub fn new(
        hierarchy: Arc<RoleHierarchyManager>,
        pipeline: Arc<PermissionPipeline>,
        bus: Arc<InvalidationBus>,
        monitor: Arc<PolicyGrowthMonitor>,
        issuer: Arc<TokenIssuer>,
    ) -> Self {
        Self {
            engine: pipeline.engine().clone(),
            hierarchy,
            pipeline,
            bus,
            monitor,
            issuer,
        }
    }

    pub fn pipeline(&self) -> &Arc<PermissionPipeline> {
        &self.pipeline
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    async fn broadcast(&self, event: InvalidationEvent) {
        self.pipeline.evict_shared(&event).await;
        self.bus.dispatch(&event).await;
        self.bus.publish_detached(event);
    }

    async fn blocking<T, F>(&self, f: F) -> WardenResult<T>
    where
        F: FnOnce(&PolicyEngine) -> WardenResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        self.pipeline.pool().run(move || f(&engine)).await?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Policies
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn reload_all(&self) -> WardenResult<()> {
        self.blocking(|engine| engine.reload()).await?;
        info!("policies reloaded by administrator");
        self.broadcast(InvalidationEvent::wildcard("policies reloaded")).await;
        Ok(())
    }

    /// Replaces every policy of `role` in `tenant` with the given grants.
    pub async fn sync_role_policies(&self, role: &RoleId, tenant: &TenantId, grants: &[ResourceGrant]) -> WardenResult<usize> {
        let entries: Vec<(String, String)> = grants
            .iter()
            .filter_map(|g| g.action_pattern().map(|a| (g.resource.clone(), a)))
            .collect();

        let existing = self.engine.domain_counts(tenant).policies_per_role.get(role).copied().unwrap_or(0);
        let growth = entries.len().saturating_sub(existing);
        if growth > 0 {
            self.monitor.ensure_can_add(tenant, role, growth)?;
        }

        let (r, t) = (role.clone(), tenant.clone());
        let installed = self
            .blocking(move |engine| engine.replace_role_policies(&r, &t, &entries))
            .await?;
        self.broadcast(InvalidationEvent::role(role.clone(), Some(tenant.clone()), "role policies synced"))
            .await;
        Ok(installed)
    }

    pub async fn add_policy(
        &self,
        role: &RoleId,
        tenant: &TenantId,
        resource: &str,
        action: &str,
        effect: Effect,
    ) -> WardenResult<bool> {
        self.monitor.ensure_can_add(tenant, role, 1)?;
        let tuple = match effect {
            Effect::Allow => PolicyTuple::allow(role.clone(), tenant.clone(), resource, action),
            Effect::Deny => PolicyTuple::deny(role.clone(), tenant.clone(), resource, action),
        };
        let added = self.blocking(move |engine| engine.add_policy_tuple(tuple)).await?;
        if added {
            self.broadcast(InvalidationEvent::role(role.clone(), Some(tenant.clone()), "policy added"))
                .await;
        }
        Ok(added)
    }

    pub async fn remove_policy(&self, role: &RoleId, tenant: &TenantId, resource: &str, action: &str) -> WardenResult<bool> {
        let (r, t, res, act) = (role.clone(), tenant.clone(), resource.to_string(), action.to_string());
        let removed = self
            .blocking(move |engine| engine.remove_policy(&r, &t, &res, &act))
            .await?;
        if removed {
            self.broadcast(InvalidationEvent::role(role.clone(), Some(tenant.clone()), "policy removed"))
                .await;
        }
        Ok(removed)
    }

    pub fn all_policies(&self) -> PolicyListing {
        PolicyListing {
            policies: self.engine.policies(),
            groupings: self.engine.groupings(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Role assignment and hierarchy
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn assign_role(&self, user: &UserId, role: &RoleId, tenant: &TenantId) -> WardenResult<bool> {
        let (u, r, t) = (user.clone(), role.clone(), tenant.clone());
        let added = self
            .blocking(move |engine| engine.add_grouping(u.as_str(), &r, &t))
            .await?;
        if added {
            self.broadcast(InvalidationEvent::user(user.clone(), Some(tenant.clone()), "role assigned"))
                .await;
        }
        Ok(added)
    }

    pub async fn revoke_role(&self, user: &UserId, role: &RoleId, tenant: &TenantId) -> WardenResult<bool> {
        let (u, r, t) = (user.clone(), role.clone(), tenant.clone());
        let removed = self
            .blocking(move |engine| engine.remove_grouping(u.as_str(), &r, &t))
            .await?;
        if removed {
            self.broadcast(InvalidationEvent::user(user.clone(), Some(tenant.clone()), "role revoked"))
                .await;
        }
        Ok(removed)
    }

    pub async fn add_role_inheritance(&self, child: &RoleId, parent: &RoleId, tenant: &TenantId) -> WardenResult<EdgeChange> {
        let hierarchy = self.hierarchy.clone();
        let (c, p, t) = (child.clone(), parent.clone(), tenant.clone());
        let change = self
            .pipeline
            .pool()
            .run(move || hierarchy.add_edge(&c, &p, &t))
            .await??;
        if change.changed {
            self.broadcast(InvalidationEvent::role(child.clone(), Some(tenant.clone()), "role inheritance added"))
                .await;
        }
        Ok(change)
    }

    /// Holders of the child role and its descendants lose inherited grants;
    /// the tenant-scoped role event reaches all of them.
    pub async fn remove_role_inheritance(&self, child: &RoleId, parent: &RoleId, tenant: &TenantId) -> WardenResult<EdgeChange> {
        let hierarchy = self.hierarchy.clone();
        let (c, p, t) = (child.clone(), parent.clone(), tenant.clone());
        let change = self
            .pipeline
            .pool()
            .run(move || hierarchy.remove_edge(&c, &p, &t))
            .await??;
        if change.changed {
            self.broadcast(InvalidationEvent::role(child.clone(), Some(tenant.clone()), "role inheritance removed"))
                .await;
        }
        Ok(change)
    }

    pub fn hierarchy(&self, tenant: &TenantId) -> Vec<RoleHierarchyEdge> {
        self.hierarchy.hierarchy(tenant)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checks, caches, tokens
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn check_permission(&self, user: &UserId, tenant: &TenantId, resource: &str, action: &str) -> WardenResult<Decision> {
        self.pipeline.check_permission_traced(user, tenant, resource, action).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.pipeline.stats()
    }

    pub async fn clear_cache(&self) {
        self.broadcast(InvalidationEvent::wildcard("cache cleared by administrator")).await;
    }

    pub async fn clear_cache_for_user(&self, user: &UserId, tenant: Option<&TenantId>) {
        self.broadcast(InvalidationEvent::user(user.clone(), tenant.cloned(), "cache cleared by administrator"))
            .await;
    }

    pub async fn clear_cache_for_tenant(&self, tenant: &TenantId) {
        self.broadcast(InvalidationEvent::tenant(tenant.clone(), "cache cleared by administrator"))
            .await;
    }

    pub async fn clear_cache_for_role(&self, role: &RoleId, tenant: Option<&TenantId>) {
        self.broadcast(InvalidationEvent::role(role.clone(), tenant.cloned(), "cache cleared by administrator"))
            .await;
    }

    pub fn validate_can_add(&self, tenant: &TenantId, role: &RoleId, count: usize) -> CapacityCheck {
        match self.monitor.ensure_can_add(tenant, role, count) {
            Ok(()) => CapacityCheck { allowed: true, reason: None },
            Err(e) => CapacityCheck {
                allowed: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// Scans now rather than waiting for the next tick.
    pub async fn growth_stats(&self) -> WardenResult<PolicyStats> {
        let monitor = self.monitor.clone();
        let (stats, _) = self.pipeline.pool().run(move || monitor.scan(Utc::now())).await?;
        Ok(stats)
    }

    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.bus.stats()
    }

    pub async fn issue_token(&self, user: &UserId, tenant: &TenantId) -> WardenResult<IssuedToken> {
        self.issuer.issue(user, tenant).await
    }

    /// Grants `user` unrestricted access in `tenant` through
    /// `BOOTSTRAP_ADMIN_ROLE`, so a fresh deployment can reach its own admin
    /// routes. Idempotent; returns whether anything was written.
    pub async fn bootstrap_admin(&self, user: &UserId, tenant: &TenantId) -> WardenResult<bool> {
        let role = RoleId::new(BOOTSTRAP_ADMIN_ROLE);
        let (u, r, t) = (user.clone(), role.clone(), tenant.clone());
        let changed = self
            .blocking(move |engine| {
                let granted = engine.add_policy(&r, &t, "*", "*")?;
                let assigned = engine.add_grouping(u.as_str(), &r, &t)?;
                Ok(granted || assigned)
            })
            .await?;
        if changed {
            info!(user_id = %user, tenant_id = %tenant, role = BOOTSTRAP_ADMIN_ROLE, "bootstrap administrator granted");
            self.broadcast(InvalidationEvent::role(role, Some(tenant.clone()), "bootstrap administrator"))
                .await;
        }
        Ok(changed)
    }
}
