//! In-memory RBAC-with-domains model.
//!
//! The model is a plain value: the engine clones it, mutates the clone and
//! publishes it. Domains are stored behind `Arc` so a mutation only copies
//! the domain it touches.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use warden_core::{Effect, GroupingKind, GroupingTuple, PolicyKey, PolicyTuple, RoleId, TenantId};

use crate::matcher::{action_alternatives, action_matches, normalize_action, resource_matches, WILDCARD};

/// Resource pattern -> set of (uppercase) actions.
pub type PermissionMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Default)]
struct DomainPolicies {
    policies: HashMap<RoleId, Vec<PolicyTuple>>,
    /// member -> roles it directly holds
    roles_of: HashMap<String, BTreeMap<RoleId, GroupingKind>>,
}

impl DomainPolicies {
    fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.roles_of.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyModel {
    domains: HashMap<TenantId, Arc<DomainPolicies>>,
}

/// Tuple counts for one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainCounts {
    pub policies: usize,
    pub groupings: usize,
    pub policies_per_role: BTreeMap<RoleId, usize>,
}

impl PolicyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tuples(
        policies: impl IntoIterator<Item = PolicyTuple>,
        groupings: impl IntoIterator<Item = GroupingTuple>,
    ) -> Self {
        let mut model = Self::new();
        for p in policies {
            model.insert_policy(p);
        }
        for g in groupings {
            model.insert_grouping(g);
        }
        model
    }

    fn domain(&self, domain: &TenantId) -> Option<&DomainPolicies> {
        self.domains.get(domain).map(|d| d.as_ref())
    }

    fn domain_mut(&mut self, domain: &TenantId) -> &mut DomainPolicies {
        Arc::make_mut(self.domains.entry(domain.clone()).or_default())
    }

    fn prune(&mut self, domain: &TenantId) {
        if self.domains.get(domain).is_some_and(|d| d.is_empty()) {
            self.domains.remove(domain);
        }
    }

    pub fn contains_policy(&self, key: &PolicyKey) -> bool {
        self.domain(&key.domain)
            .and_then(|d| d.policies.get(&key.subject))
            .is_some_and(|ps| ps.iter().any(|p| p.resource == key.resource && p.action == key.action))
    }

    pub fn contains_grouping(&self, member: &str, role: &RoleId, domain: &TenantId) -> bool {
        self.domain(domain)
            .and_then(|d| d.roles_of.get(member))
            .is_some_and(|roles| roles.contains_key(role))
    }

    /// Returns `false` when a tuple with the same key already exists.
    pub fn insert_policy(&mut self, tuple: PolicyTuple) -> bool {
        if self.contains_policy(&tuple.key()) {
            return false;
        }
        let domain = tuple.domain.clone();
        self.domain_mut(&domain)
            .policies
            .entry(tuple.subject.clone())
            .or_default()
            .push(tuple);
        true
    }

    pub fn remove_policy(&mut self, key: &PolicyKey) -> bool {
        if !self.contains_policy(key) {
            return false;
        }
        let d = self.domain_mut(&key.domain);
        if let Some(ps) = d.policies.get_mut(&key.subject) {
            ps.retain(|p| !(p.resource == key.resource && p.action == key.action));
            if ps.is_empty() {
                d.policies.remove(&key.subject);
            }
        }
        self.prune(&key.domain);
        true
    }

    pub fn insert_grouping(&mut self, tuple: GroupingTuple) -> bool {
        if self.contains_grouping(&tuple.member, &tuple.role, &tuple.domain) {
            return false;
        }
        self.domain_mut(&tuple.domain)
            .roles_of
            .entry(tuple.member)
            .or_default()
            .insert(tuple.role, tuple.kind);
        true
    }

    pub fn remove_grouping(&mut self, member: &str, role: &RoleId, domain: &TenantId) -> bool {
        if !self.contains_grouping(member, role, domain) {
            return false;
        }
        let d = self.domain_mut(domain);
        if let Some(roles) = d.roles_of.get_mut(member) {
            roles.remove(role);
            if roles.is_empty() {
                d.roles_of.remove(member);
            }
        }
        self.prune(domain);
        true
    }

    /// Drops every tuple of `domain` and installs the given ones.
    pub fn replace_domain(
        &mut self,
        domain: &TenantId,
        policies: impl IntoIterator<Item = PolicyTuple>,
        groupings: impl IntoIterator<Item = GroupingTuple>,
    ) {
        self.domains.remove(domain);
        for p in policies.into_iter().filter(|p| &p.domain == domain) {
            self.insert_policy(p);
        }
        for g in groupings.into_iter().filter(|g| &g.domain == domain) {
            self.insert_grouping(g);
        }
    }

    /// Roles directly assigned to `subject` in `domain`.
    pub fn roles_for(&self, subject: &str, domain: &TenantId) -> BTreeSet<RoleId> {
        self.domain(domain)
            .and_then(|d| d.roles_of.get(subject))
            .map(|roles| roles.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every role reachable from `subject`: its direct roles, then role
    /// inheritance any number of hops.
    ///
    /// Only the first hop may follow a user-role grouping. Past it, a role
    /// that was assigned as a member of another role is not an inheritance
    /// edge, since those never went through the hierarchy's cycle and depth
    /// checks.
    pub fn implicit_roles_for(&self, subject: &str, domain: &TenantId) -> BTreeSet<RoleId> {
        let Some(d) = self.domain(domain) else {
            return BTreeSet::new();
        };

        let mut seen: BTreeSet<RoleId> = BTreeSet::new();
        let mut queue: VecDeque<(&str, bool)> = VecDeque::from([(subject, true)]);
        while let Some((member, direct)) = queue.pop_front() {
            let Some(roles) = d.roles_of.get(member) else {
                continue;
            };
            for (role, kind) in roles {
                if !direct && *kind != GroupingKind::RoleInheritance {
                    continue;
                }
                if seen.insert(role.clone()) {
                    queue.push_back((role.as_str(), false));
                }
            }
        }
        seen
    }

    fn subjects(&self, subject: &str, domain: &TenantId) -> Vec<RoleId> {
        let mut subjects = vec![RoleId::new(subject)];
        subjects.extend(self.implicit_roles_for(subject, domain));
        subjects
    }

    /// Evaluates a request. An explicit deny overrides any allow.
    pub fn enforce(&self, subject: &str, domain: &TenantId, resource: &str, action: &str) -> bool {
        let Some(d) = self.domain(domain) else {
            return false;
        };

        let mut allowed = false;
        for s in self.subjects(subject, domain) {
            let Some(ps) = d.policies.get(&s) else {
                continue;
            };
            for p in ps {
                if !resource_matches(&p.resource, resource) || !action_matches(&p.action, action) {
                    continue;
                }
                match p.effect {
                    Effect::Deny => return false,
                    Effect::Allow => allowed = true,
                }
            }
        }
        allowed
    }

    /// Allowed resource patterns and actions for `subject`, inheritance expanded.
    ///
    /// Deny tuples subtract only from allows with the identical resource
    /// pattern (or everything, for a bare `*` pattern); `enforce` stays the
    /// authority for overlapping patterns.
    pub fn implicit_permissions(&self, subject: &str, domain: &TenantId) -> PermissionMap {
        let mut map = PermissionMap::new();
        let Some(d) = self.domain(domain) else {
            return map;
        };

        let mut denies = Vec::new();
        for s in self.subjects(subject, domain) {
            let Some(ps) = d.policies.get(&s) else {
                continue;
            };
            for p in ps {
                match p.effect {
                    Effect::Allow => {
                        let actions = map.entry(p.resource.clone()).or_default();
                        actions.extend(action_alternatives(&p.action).map(normalize_action));
                    }
                    Effect::Deny => denies.push(p),
                }
            }
        }

        for deny in denies {
            let denied: BTreeSet<String> = action_alternatives(&deny.action).map(normalize_action).collect();
            for (resource, actions) in map.iter_mut() {
                if deny.resource != WILDCARD && &deny.resource != resource {
                    continue;
                }
                if denied.contains(WILDCARD) {
                    actions.clear();
                } else {
                    actions.retain(|a| !denied.contains(a));
                }
            }
        }
        map.retain(|_, actions| !actions.is_empty());
        map
    }

    /// `(child, parent)` pairs of role inheritance in `domain`.
    pub fn role_edges(&self, domain: &TenantId) -> Vec<(RoleId, RoleId)> {
        let Some(d) = self.domain(domain) else {
            return Vec::new();
        };
        let mut edges: Vec<(RoleId, RoleId)> = d
            .roles_of
            .iter()
            .flat_map(|(member, roles)| {
                roles
                    .iter()
                    .filter(|(_, kind)| **kind == GroupingKind::RoleInheritance)
                    .map(move |(role, _)| (RoleId::new(member.clone()), role.clone()))
            })
            .collect();
        edges.sort();
        edges
    }

    pub fn policies_for_role(&self, role: &RoleId, domain: &TenantId) -> Vec<PolicyTuple> {
        self.domain(domain)
            .and_then(|d| d.policies.get(role))
            .cloned()
            .unwrap_or_default()
    }

    pub fn policies(&self) -> Vec<PolicyTuple> {
        let mut out: Vec<PolicyTuple> = self
            .domains
            .values()
            .flat_map(|d| d.policies.values().flatten().cloned())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    pub fn groupings(&self) -> Vec<GroupingTuple> {
        let mut out: Vec<GroupingTuple> = self
            .domains
            .iter()
            .flat_map(|(domain, d)| {
                d.roles_of.iter().flat_map(move |(member, roles)| {
                    roles.iter().map(move |(role, kind)| GroupingTuple {
                        member: member.clone(),
                        role: role.clone(),
                        domain: domain.clone(),
                        kind: *kind,
                    })
                })
            })
            .collect();
        out.sort();
        out
    }

    /// Domains whose tuples differ between `self` and `other`, sorted.
    pub fn changed_domains(&self, other: &PolicyModel) -> Vec<TenantId> {
        let mut domains: BTreeSet<&TenantId> = self.domains.keys().collect();
        domains.extend(other.domains.keys());
        domains
            .into_iter()
            .filter(|d| match (self.domains.get(*d), other.domains.get(*d)) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b) && Self::tuples_of(a) != Self::tuples_of(b),
                _ => true,
            })
            .cloned()
            .collect()
    }

    fn tuples_of(d: &DomainPolicies) -> (Vec<(PolicyKey, Effect)>, Vec<(&str, &RoleId, GroupingKind)>) {
        let mut policies: Vec<_> = d.policies.values().flatten().map(|p| (p.key(), p.effect)).collect();
        policies.sort();
        let mut groupings: Vec<_> = d
            .roles_of
            .iter()
            .flat_map(|(member, roles)| roles.iter().map(move |(role, kind)| (member.as_str(), role, *kind)))
            .collect();
        groupings.sort();
        (policies, groupings)
    }

    pub fn counts(&self) -> BTreeMap<TenantId, DomainCounts> {
        self.domains
            .iter()
            .map(|(domain, d)| (domain.clone(), Self::count(d)))
            .collect()
    }

    pub fn domain_counts(&self, domain: &TenantId) -> DomainCounts {
        self.domain(domain).map(Self::count).unwrap_or_default()
    }

    fn count(d: &DomainPolicies) -> DomainCounts {
        let policies_per_role: BTreeMap<RoleId, usize> =
            d.policies.iter().map(|(r, ps)| (r.clone(), ps.len())).collect();
        DomainCounts {
            policies: policies_per_role.values().sum(),
            groupings: d.roles_of.values().map(|r| r.len()).sum(),
            policies_per_role,
        }
    }
}
