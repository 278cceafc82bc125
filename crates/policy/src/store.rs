//! Durable tuple storage boundary.
//!
//! The engine calls the store synchronously from the blocking worker pool;
//! implementations may block on IO.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use warden_core::{GroupingTuple, PolicyKey, PolicyTuple, RoleId, TenantId, WardenError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("stored tuple is malformed: {0}")]
    Corrupt(String),
}

impl From<StoreError> for WardenError {
    fn from(value: StoreError) -> Self {
        WardenError::store(value.to_string())
    }
}

/// Full or per-domain contents of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredPolicies {
    pub policies: Vec<PolicyTuple>,
    pub groupings: Vec<GroupingTuple>,
}

pub trait PolicyStore: Send + Sync {
    fn load_all(&self) -> Result<StoredPolicies, StoreError>;

    fn load_domain(&self, domain: &TenantId) -> Result<StoredPolicies, StoreError>;

    /// Returns `false` if a tuple with the same key was already stored.
    fn insert_policy(&self, tuple: &PolicyTuple) -> Result<bool, StoreError>;

    fn delete_policy(&self, key: &PolicyKey) -> Result<bool, StoreError>;

    fn insert_grouping(&self, tuple: &GroupingTuple) -> Result<bool, StoreError>;

    fn delete_grouping(
        &self,
        member: &str,
        role: &RoleId,
        domain: &TenantId,
    ) -> Result<bool, StoreError>;

    /// Atomically replaces every policy of `role` in `domain`.
    fn replace_role_policies(
        &self,
        role: &RoleId,
        domain: &TenantId,
        tuples: &[PolicyTuple],
    ) -> Result<(), StoreError>;
}

impl<S> PolicyStore for Arc<S>
where
    S: PolicyStore + ?Sized,
{
    fn load_all(&self) -> Result<StoredPolicies, StoreError> {
        (**self).load_all()
    }

    fn load_domain(&self, domain: &TenantId) -> Result<StoredPolicies, StoreError> {
        (**self).load_domain(domain)
    }

    fn insert_policy(&self, tuple: &PolicyTuple) -> Result<bool, StoreError> {
        (**self).insert_policy(tuple)
    }

    fn delete_policy(&self, key: &PolicyKey) -> Result<bool, StoreError> {
        (**self).delete_policy(key)
    }

    fn insert_grouping(&self, tuple: &GroupingTuple) -> Result<bool, StoreError> {
        (**self).insert_grouping(tuple)
    }

    fn delete_grouping(
        &self,
        member: &str,
        role: &RoleId,
        domain: &TenantId,
    ) -> Result<bool, StoreError> {
        (**self).delete_grouping(member, role, domain)
    }

    fn replace_role_policies(
        &self,
        role: &RoleId,
        domain: &TenantId,
        tuples: &[PolicyTuple],
    ) -> Result<(), StoreError> {
        (**self).replace_role_policies(role, domain, tuples)
    }
}

type GroupingKey = (String, RoleId, TenantId);

#[derive(Debug, Default)]
struct Tables {
    policies: BTreeMap<PolicyKey, PolicyTuple>,
    groupings: BTreeMap<GroupingKey, GroupingTuple>,
}

/// In-memory store for tests/dev.
///
/// `set_unavailable(true)` makes every call fail, which lets tests observe
/// that failed writes never reach the in-memory model.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tuples(
        policies: impl IntoIterator<Item = PolicyTuple>,
        groupings: impl IntoIterator<Item = GroupingTuple>,
    ) -> Self {
        let store = Self::new();
        if let Ok(mut t) = store.tables.write() {
            for p in policies {
                t.policies.entry(p.key()).or_insert(p);
            }
            for g in groupings {
                t.groupings.entry(g.key()).or_insert(g);
            }
        }
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.check()?;
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.check()?;
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn load_all(&self) -> Result<StoredPolicies, StoreError> {
        let t = self.read()?;
        Ok(StoredPolicies {
            policies: t.policies.values().cloned().collect(),
            groupings: t.groupings.values().cloned().collect(),
        })
    }

    fn load_domain(&self, domain: &TenantId) -> Result<StoredPolicies, StoreError> {
        let t = self.read()?;
        Ok(StoredPolicies {
            policies: t
                .policies
                .values()
                .filter(|p| &p.domain == domain)
                .cloned()
                .collect(),
            groupings: t
                .groupings
                .values()
                .filter(|g| &g.domain == domain)
                .cloned()
                .collect(),
        })
    }

    fn insert_policy(&self, tuple: &PolicyTuple) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let key = tuple.key();
        if t.policies.contains_key(&key) {
            return Ok(false);
        }
        t.policies.insert(key, tuple.clone());
        Ok(true)
    }

    fn delete_policy(&self, key: &PolicyKey) -> Result<bool, StoreError> {
        Ok(self.write()?.policies.remove(key).is_some())
    }

    fn insert_grouping(&self, tuple: &GroupingTuple) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let key = tuple.key();
        if t.groupings.contains_key(&key) {
            return Ok(false);
        }
        t.groupings.insert(key, tuple.clone());
        Ok(true)
    }

    fn delete_grouping(
        &self,
        member: &str,
        role: &RoleId,
        domain: &TenantId,
    ) -> Result<bool, StoreError> {
        let key = (member.to_string(), role.clone(), domain.clone());
        Ok(self.write()?.groupings.remove(&key).is_some())
    }

    fn replace_role_policies(
        &self,
        role: &RoleId,
        domain: &TenantId,
        tuples: &[PolicyTuple],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        t.policies
            .retain(|k, _| !(&k.subject == role && &k.domain == domain));
        for p in tuples {
            t.policies.entry(p.key()).or_insert_with(|| p.clone());
        }
        Ok(())
    }
}
