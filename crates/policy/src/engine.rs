//! Policy engine: the evaluator of record.
//!
//! Evaluation reads an immutable `Arc<PolicyModel>` snapshot and never takes
//! the writer lock. Mutations are serialized through one writer lock, written
//! to the store first, then applied to a copy of the model which replaces the
//! published snapshot. A failed store write leaves the model untouched.
//!
//! Every method here may block on store IO; async callers dispatch through
//! the blocking worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use warden_core::{GroupingTuple, PolicyTuple, RoleId, TenantId, WardenResult};

use crate::model::{DomainCounts, PermissionMap, PolicyModel};
use crate::store::PolicyStore;

pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    model: RwLock<Arc<PolicyModel>>,
    generation: AtomicU64,
    writer: Mutex<()>,
}

impl core::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Builds the engine from a full load of `store`.
    ///
    /// The engine does not exist until the load succeeds, so no evaluation
    /// can observe a partially loaded model.
    pub fn load(store: Arc<dyn PolicyStore>) -> WardenResult<Self> {
        let stored = store.load_all()?;
        info!(
            policies = stored.policies.len(),
            groupings = stored.groupings.len(),
            "policy model loaded"
        );
        let model = PolicyModel::from_tuples(stored.policies, stored.groupings);
        Ok(Self {
            store,
            model: RwLock::new(Arc::new(model)),
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
        })
    }

    /// Current published model.
    pub fn snapshot(&self) -> Arc<PolicyModel> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bumped every time a new model is published.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn publish(&self, model: PolicyModel) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(model);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&dyn PolicyStore, &PolicyModel) -> WardenResult<Option<(PolicyModel, T)>>,
        unchanged: T,
    ) -> WardenResult<T> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        match f(self.store.as_ref(), &current)? {
            Some((next, out)) => {
                self.publish(next);
                Ok(out)
            }
            None => Ok(unchanged),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn enforce(&self, subject: &str, domain: &TenantId, resource: &str, action: &str) -> bool {
        self.snapshot().enforce(subject, domain, resource, action)
    }

    pub fn implicit_permissions(&self, subject: &str, domain: &TenantId) -> PermissionMap {
        self.snapshot().implicit_permissions(subject, domain)
    }

    pub fn roles_for(&self, subject: &str, domain: &TenantId) -> BTreeSet<RoleId> {
        self.snapshot().roles_for(subject, domain)
    }

    pub fn implicit_roles_for(&self, subject: &str, domain: &TenantId) -> BTreeSet<RoleId> {
        self.snapshot().implicit_roles_for(subject, domain)
    }

    pub fn policies(&self) -> Vec<PolicyTuple> {
        self.snapshot().policies()
    }

    pub fn groupings(&self) -> Vec<GroupingTuple> {
        self.snapshot().groupings()
    }

    pub fn role_edges(&self, domain: &TenantId) -> Vec<(RoleId, RoleId)> {
        self.snapshot().role_edges(domain)
    }

    pub fn counts(&self) -> BTreeMap<TenantId, DomainCounts> {
        self.snapshot().counts()
    }

    pub fn domain_counts(&self, domain: &TenantId) -> DomainCounts {
        self.snapshot().domain_counts(domain)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_policy(
        &self,
        role: &RoleId,
        domain: &TenantId,
        resource: &str,
        action: &str,
    ) -> WardenResult<bool> {
        self.add_policy_tuple(PolicyTuple::allow(role.clone(), domain.clone(), resource, action))
    }

    pub fn add_deny_policy(
        &self,
        role: &RoleId,
        domain: &TenantId,
        resource: &str,
        action: &str,
    ) -> WardenResult<bool> {
        self.add_policy_tuple(PolicyTuple::deny(role.clone(), domain.clone(), resource, action))
    }

    /// Returns `false` when a tuple with the same key already exists.
    pub fn add_policy_tuple(&self, tuple: PolicyTuple) -> WardenResult<bool> {
        self.mutate(
            |store, current| {
                if current.contains_policy(&tuple.key()) {
                    return Ok(None);
                }
                store.insert_policy(&tuple)?;
                let mut next = current.clone();
                debug!(role = %tuple.subject, tenant = %tuple.domain, resource = %tuple.resource, "policy added");
                next.insert_policy(tuple);
                Ok(Some((next, true)))
            },
            false,
        )
    }

    pub fn remove_policy(
        &self,
        role: &RoleId,
        domain: &TenantId,
        resource: &str,
        action: &str,
    ) -> WardenResult<bool> {
        let key = PolicyTuple::allow(role.clone(), domain.clone(), resource, action).key();
        self.mutate(
            |store, current| {
                if !current.contains_policy(&key) {
                    return Ok(None);
                }
                store.delete_policy(&key)?;
                let mut next = current.clone();
                next.remove_policy(&key);
                debug!(role = %key.subject, tenant = %key.domain, resource = %key.resource, "policy removed");
                Ok(Some((next, true)))
            },
            false,
        )
    }

    pub fn add_grouping(&self, member: &str, role: &RoleId, domain: &TenantId) -> WardenResult<bool> {
        self.add_grouping_tuple(GroupingTuple::user_role(member, role.clone(), domain.clone()))
    }

    /// `child` inherits every permission of `parent`.
    ///
    /// Performs no cycle or depth validation; use `RoleHierarchyManager`.
    pub fn add_role_inheritance(
        &self,
        child: &RoleId,
        parent: &RoleId,
        domain: &TenantId,
    ) -> WardenResult<bool> {
        self.add_grouping_tuple(GroupingTuple::inheritance(child.clone(), parent.clone(), domain.clone()))
    }

    fn add_grouping_tuple(&self, tuple: GroupingTuple) -> WardenResult<bool> {
        self.mutate(
            |store, current| {
                if current.contains_grouping(&tuple.member, &tuple.role, &tuple.domain) {
                    return Ok(None);
                }
                store.insert_grouping(&tuple)?;
                let mut next = current.clone();
                debug!(member = %tuple.member, role = %tuple.role, tenant = %tuple.domain, "grouping added");
                next.insert_grouping(tuple);
                Ok(Some((next, true)))
            },
            false,
        )
    }

    pub fn remove_grouping(&self, member: &str, role: &RoleId, domain: &TenantId) -> WardenResult<bool> {
        self.mutate(
            |store, current| {
                if !current.contains_grouping(member, role, domain) {
                    return Ok(None);
                }
                store.delete_grouping(member, role, domain)?;
                let mut next = current.clone();
                next.remove_grouping(member, role, domain);
                debug!(member, role = %role, tenant = %domain, "grouping removed");
                Ok(Some((next, true)))
            },
            false,
        )
    }

    /// Replaces every policy of `role` in `domain`, allow and deny alike, with
    /// allow policies for `entries` (`(resource, action)` pairs). Returns the
    /// number of policies installed.
    pub fn replace_role_policies(
        &self,
        role: &RoleId,
        domain: &TenantId,
        entries: &[(String, String)],
    ) -> WardenResult<usize> {
        let tuples: Vec<PolicyTuple> = entries
            .iter()
            .map(|(res, act)| PolicyTuple::allow(role.clone(), domain.clone(), res.as_str(), act.as_str()))
            .collect();

        self.mutate(
            |store, current| {
                store.replace_role_policies(role, domain, &tuples)?;
                let mut next = current.clone();
                for old in current.policies_for_role(role, domain) {
                    next.remove_policy(&old.key());
                }
                let installed = tuples
                    .iter()
                    .filter(|t| next.insert_policy((*t).clone()))
                    .count();
                info!(role = %role, tenant = %domain, installed, "role policies synced");
                Ok(Some((next, installed)))
            },
            0,
        )
    }

    /// Discards the in-memory model and reloads everything from the store.
    pub fn reload(&self) -> WardenResult<()> {
        self.mutate(
            |store, _| {
                let stored = store.load_all()?;
                info!(
                    policies = stored.policies.len(),
                    groupings = stored.groupings.len(),
                    "policy model reloaded"
                );
                Ok(Some((PolicyModel::from_tuples(stored.policies, stored.groupings), ())))
            },
            (),
        )
    }

    /// Reloads from the store and publishes only if something changed.
    /// Returns the domains whose tuples differ from the previous model.
    ///
    /// Used by periodic resync to bound how long an instance that missed an
    /// invalidation keeps evaluating an outdated model.
    pub fn resync(&self) -> WardenResult<Vec<TenantId>> {
        self.mutate(
            |store, current| {
                let stored = store.load_all()?;
                let next = PolicyModel::from_tuples(stored.policies, stored.groupings);
                let changed = current.changed_domains(&next);
                if changed.is_empty() {
                    return Ok(None);
                }
                info!(domains = changed.len(), "policy model out of date, resynced from store");
                Ok(Some((next, changed)))
            },
            Vec::new(),
        )
    }

    /// Reloads a single domain from the store.
    pub fn reload_domain(&self, domain: &TenantId) -> WardenResult<()> {
        self.mutate(
            |store, current| {
                let stored = store.load_domain(domain)?;
                let mut next = current.clone();
                next.replace_domain(domain, stored.policies, stored.groupings);
                debug!(tenant = %domain, "policy domain reloaded");
                Ok(Some((next, ())))
            },
            (),
        )
    }
}
