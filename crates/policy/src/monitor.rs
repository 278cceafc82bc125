//! Policy growth monitoring.
//!
//! Evaluation cost grows with the number of tuples in a domain, so the
//! monitor classifies the total against thresholds on every scan and offers
//! a pre-flight ceiling check for bulk additions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use warden_core::{RoleId, TenantId, WardenError, WardenResult};

use crate::engine::PolicyEngine;
use crate::model::DomainCounts;

pub const DEFAULT_WARNING_THRESHOLD: usize = 10_000;
pub const DEFAULT_CRITICAL_THRESHOLD: usize = 50_000;
pub const DEFAULT_EMERGENCY_THRESHOLD: usize = 100_000;
pub const DEFAULT_MAX_POLICIES_PER_TENANT: usize = 10_000;
pub const DEFAULT_MAX_POLICIES_PER_ROLE: usize = 1_000;

const TOP_TENANTS: usize = 5;
const TOP_ROLES: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthThresholds {
    pub warning: usize,
    pub critical: usize,
    pub emergency: usize,
    pub max_per_tenant: usize,
    pub max_per_role: usize,
}

impl Default for GrowthThresholds {
    fn default() -> Self {
        Self {
            warning: DEFAULT_WARNING_THRESHOLD,
            critical: DEFAULT_CRITICAL_THRESHOLD,
            emergency: DEFAULT_EMERGENCY_THRESHOLD,
            max_per_tenant: DEFAULT_MAX_POLICIES_PER_TENANT,
            max_per_role: DEFAULT_MAX_POLICIES_PER_ROLE,
        }
    }
}

impl GrowthThresholds {
    pub fn classify(&self, total: usize) -> AlertLevel {
        if total >= self.emergency {
            AlertLevel::Emergency
        } else if total >= self.critical {
            AlertLevel::Critical
        } else if total >= self.warning {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }
}

/// Result of one scan. Recomputed every tick; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub total_policies: usize,
    pub total_groupings: usize,
    pub level: AlertLevel,
    pub per_tenant: BTreeMap<TenantId, usize>,
    pub tenants_over_limit: Vec<TenantId>,
    pub roles_over_limit: Vec<(TenantId, RoleId, usize)>,
    pub computed_at: DateTime<Utc>,
}

impl PolicyStats {
    fn from_counts(counts: &BTreeMap<TenantId, DomainCounts>, thresholds: &GrowthThresholds, now: DateTime<Utc>) -> Self {
        let total_policies = counts.values().map(|c| c.policies).sum();
        let tenants_over_limit = counts
            .iter()
            .filter(|(_, c)| c.policies > thresholds.max_per_tenant)
            .map(|(t, _)| t.clone())
            .collect();
        let roles_over_limit = counts
            .iter()
            .flat_map(|(t, c)| {
                c.policies_per_role
                    .iter()
                    .filter(|(_, n)| **n > thresholds.max_per_role)
                    .map(move |(r, n)| (t.clone(), r.clone(), *n))
            })
            .collect();

        Self {
            total_policies,
            total_groupings: counts.values().map(|c| c.groupings).sum(),
            level: thresholds.classify(total_policies),
            per_tenant: counts.iter().map(|(t, c)| (t.clone(), c.policies)).collect(),
            tenants_over_limit,
            roles_over_limit,
            computed_at: now,
        }
    }

    /// Tenants ordered by policy count, largest first.
    pub fn top_tenants(&self, n: usize) -> Vec<(TenantId, usize)> {
        let mut sorted: Vec<_> = self.per_tenant.iter().map(|(t, c)| (t.clone(), *c)).collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted.truncate(n);
        sorted
    }
}

/// A change of alert level between two scans.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LevelTransition {
    pub from: AlertLevel,
    pub to: AlertLevel,
}

#[derive(Debug)]
struct MonitorState {
    level: AlertLevel,
    last: Option<PolicyStats>,
}

pub struct PolicyGrowthMonitor {
    engine: Arc<PolicyEngine>,
    thresholds: GrowthThresholds,
    state: Mutex<MonitorState>,
}

impl PolicyGrowthMonitor {
    pub fn new(engine: Arc<PolicyEngine>, thresholds: GrowthThresholds) -> Self {
        Self {
            engine,
            thresholds,
            state: Mutex::new(MonitorState {
                level: AlertLevel::Normal,
                last: None,
            }),
        }
    }

    pub fn thresholds(&self) -> &GrowthThresholds {
        &self.thresholds
    }

    pub fn current_level(&self) -> AlertLevel {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).level
    }

    pub fn last_stats(&self) -> Option<PolicyStats> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    /// Counts tuples, classifies and logs. Returns the transition, if any.
    pub fn scan(&self, now: DateTime<Utc>) -> (PolicyStats, Option<LevelTransition>) {
        let counts = self.engine.counts();
        let stats = PolicyStats::from_counts(&counts, &self.thresholds, now);

        let transition = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = state.level;
            state.level = stats.level;
            state.last = Some(stats.clone());
            (from != stats.level).then_some(LevelTransition { from, to: stats.level })
        };

        if let Some(t) = transition {
            log_transition(t, stats.total_policies);
        }

        for tenant in &stats.tenants_over_limit {
            warn!(tenant = %tenant, count = stats.per_tenant[tenant], limit = self.thresholds.max_per_tenant, "tenant over policy ceiling");
        }
        for (tenant, role, count) in &stats.roles_over_limit {
            warn!(tenant = %tenant, role = %role, count, limit = self.thresholds.max_per_role, "role over policy ceiling");
        }

        if stats.level >= AlertLevel::Warning {
            for (tenant, count) in stats.top_tenants(TOP_TENANTS) {
                info!(tenant = %tenant, count, "top tenant by policy count");
            }
            for (tenant, role, count) in top_roles(&counts, TOP_ROLES) {
                info!(tenant = %tenant, role = %role, count, "top role by policy count");
            }
        }

        (stats, transition)
    }

    /// Whether `count` more policies for `role` fit under the ceilings.
    pub fn can_add(&self, tenant: &TenantId, role: &RoleId, count: usize) -> bool {
        self.ensure_can_add(tenant, role, count).is_ok()
    }

    pub fn ensure_can_add(&self, tenant: &TenantId, role: &RoleId, count: usize) -> WardenResult<()> {
        let counts = self.engine.domain_counts(tenant);
        let tenant_total = counts.policies + count;
        if tenant_total > self.thresholds.max_per_tenant {
            return Err(WardenError::capacity(format!(
                "tenant {tenant} would hold {tenant_total} policies (limit {})",
                self.thresholds.max_per_tenant
            )));
        }

        let role_total = counts.policies_per_role.get(role).copied().unwrap_or(0) + count;
        if role_total > self.thresholds.max_per_role {
            return Err(WardenError::capacity(format!(
                "role {role} in {tenant} would hold {role_total} policies (limit {})",
                self.thresholds.max_per_role
            )));
        }
        Ok(())
    }
}

fn log_transition(t: LevelTransition, total: usize) {
    if t.to < t.from {
        info!(from = ?t.from, to = ?t.to, total, "policy growth level recovered");
        return;
    }
    match t.to {
        AlertLevel::Normal => {}
        AlertLevel::Warning => warn!(from = ?t.from, to = ?t.to, total, "policy growth level raised"),
        AlertLevel::Critical | AlertLevel::Emergency => {
            error!(from = ?t.from, to = ?t.to, total, "policy growth level raised")
        }
    }
}

fn top_roles(counts: &BTreeMap<TenantId, DomainCounts>, n: usize) -> Vec<(TenantId, RoleId, usize)> {
    let mut all: Vec<_> = counts
        .iter()
        .flat_map(|(t, c)| c.policies_per_role.iter().map(move |(r, n)| (t.clone(), r.clone(), *n)))
        .collect();
    all.sort_by(|a, b| b.2.cmp(&a.2));
    all.truncate(n);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPolicyStore;

    fn engine() -> Arc<PolicyEngine> {
        Arc::new(PolicyEngine::load(Arc::new(InMemoryPolicyStore::new())).unwrap())
    }

    fn small() -> GrowthThresholds {
        GrowthThresholds {
            warning: 2,
            critical: 4,
            emergency: 6,
            max_per_tenant: 5,
            max_per_role: 3,
        }
    }

    #[test]
    fn classification_uses_inclusive_thresholds() {
        let t = GrowthThresholds::default();
        assert_eq!(t.classify(9_999), AlertLevel::Normal);
        assert_eq!(t.classify(10_000), AlertLevel::Warning);
        assert_eq!(t.classify(50_000), AlertLevel::Critical);
        assert_eq!(t.classify(250_000), AlertLevel::Emergency);
    }

    #[test]
    fn scan_reports_each_transition_once() {
        let engine = engine();
        let monitor = PolicyGrowthMonitor::new(engine.clone(), small());
        let (r, t) = (RoleId::new("R"), TenantId::new("t"));

        let (_, first) = monitor.scan(Utc::now());
        assert!(first.is_none());

        engine.add_policy(&r, &t, "/a", "GET").unwrap();
        engine.add_policy(&r, &t, "/b", "GET").unwrap();
        let (stats, raised) = monitor.scan(Utc::now());
        assert_eq!(stats.level, AlertLevel::Warning);
        assert_eq!(raised, Some(LevelTransition { from: AlertLevel::Normal, to: AlertLevel::Warning }));

        let (_, again) = monitor.scan(Utc::now());
        assert!(again.is_none());
    }

    #[test]
    fn can_add_respects_tenant_and_role_ceilings() {
        let engine = engine();
        let monitor = PolicyGrowthMonitor::new(engine.clone(), small());
        let (r, t) = (RoleId::new("R"), TenantId::new("t"));
        engine.add_policy(&r, &t, "/a", "GET").unwrap();
        engine.add_policy(&r, &t, "/b", "GET").unwrap();

        assert!(monitor.can_add(&t, &r, 1));
        assert!(!monitor.can_add(&t, &r, 2));
        assert!(monitor.can_add(&t, &RoleId::new("OTHER"), 3));
        assert!(matches!(
            monitor.ensure_can_add(&t, &RoleId::new("OTHER"), 4),
            Err(WardenError::CapacityExceeded(_))
        ));
    }
}
