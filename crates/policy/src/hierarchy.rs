//! Role hierarchy: per-domain inheritance edges with cycle and depth guards.
//!
//! An edge `child -> parent` means `child` inherits every permission of
//! `parent`. Edges are stored as inheritance groupings in the engine; this
//! manager is the only path that validates them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use warden_core::{RoleId, TenantId, WardenError, WardenResult};

use crate::engine::PolicyEngine;

pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleHierarchyEdge {
    pub parent: RoleId,
    pub child: RoleId,
    pub domain: TenantId,
    pub level: usize,
}

/// Result of an edge mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeChange {
    pub edge: RoleHierarchyEdge,
    /// `false` when the edge already existed (add) or was absent (remove).
    pub changed: bool,
    /// The child and every role inheriting from it; holders of these roles
    /// see their effective permissions change.
    pub affected_roles: BTreeSet<RoleId>,
}

/// Adjacency view of one domain's edges.
struct Graph {
    parents: BTreeMap<RoleId, Vec<RoleId>>,
    children: BTreeMap<RoleId, Vec<RoleId>>,
}

impl Graph {
    fn new(edges: &[(RoleId, RoleId)]) -> Self {
        let mut parents: BTreeMap<RoleId, Vec<RoleId>> = BTreeMap::new();
        let mut children: BTreeMap<RoleId, Vec<RoleId>> = BTreeMap::new();
        for (child, parent) in edges {
            parents.entry(child.clone()).or_default().push(parent.clone());
            children.entry(parent.clone()).or_default().push(child.clone());
        }
        Self { parents, children }
    }

    fn contains(&self, child: &RoleId, parent: &RoleId) -> bool {
        self.parents.get(child).is_some_and(|ps| ps.contains(parent))
    }

    fn reachable(adjacency: &BTreeMap<RoleId, Vec<RoleId>>, from: &RoleId) -> BTreeSet<RoleId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from.clone()];
        while let Some(node) = stack.pop() {
            for next in adjacency.get(&node).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    stack.push(next.clone());
                }
            }
        }
        seen
    }

    fn ancestors(&self, role: &RoleId) -> BTreeSet<RoleId> {
        Self::reachable(&self.parents, role)
    }

    fn descendants(&self, role: &RoleId) -> BTreeSet<RoleId> {
        Self::reachable(&self.children, role)
    }

    /// Longest chain of edges from `role` following `adjacency`.
    fn longest(
        adjacency: &BTreeMap<RoleId, Vec<RoleId>>,
        role: &RoleId,
        memo: &mut HashMap<RoleId, usize>,
    ) -> usize {
        if let Some(d) = memo.get(role) {
            return *d;
        }
        let depth = adjacency
            .get(role)
            .into_iter()
            .flatten()
            .map(|next| 1 + Self::longest(adjacency, next, memo))
            .max()
            .unwrap_or(0);
        memo.insert(role.clone(), depth);
        depth
    }

    fn depth_above(&self, role: &RoleId) -> usize {
        Self::longest(&self.parents, role, &mut HashMap::new())
    }

    fn depth_below(&self, role: &RoleId) -> usize {
        Self::longest(&self.children, role, &mut HashMap::new())
    }
}

type Closure = DashMap<(TenantId, RoleId), (u64, Arc<BTreeSet<RoleId>>)>;

pub struct RoleHierarchyManager {
    engine: Arc<PolicyEngine>,
    max_depth: usize,
    writer: Mutex<()>,
    ancestors: Closure,
    descendants: Closure,
}

impl RoleHierarchyManager {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self::with_max_depth(engine, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(engine: Arc<PolicyEngine>, max_depth: usize) -> Self {
        Self {
            engine,
            max_depth,
            writer: Mutex::new(()),
            ancestors: DashMap::new(),
            descendants: DashMap::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn graph(&self, domain: &TenantId) -> Graph {
        Graph::new(&self.engine.role_edges(domain))
    }

    fn forget(&self, domain: &TenantId) {
        self.ancestors.retain(|(d, _), _| d != domain);
        self.descendants.retain(|(d, _), _| d != domain);
    }

    fn closure(
        &self,
        memo: &Closure,
        role: &RoleId,
        domain: &TenantId,
        compute: impl FnOnce(&Graph, &RoleId) -> BTreeSet<RoleId>,
    ) -> Arc<BTreeSet<RoleId>> {
        let generation = self.engine.generation();
        let key = (domain.clone(), role.clone());
        if let Some(entry) = memo.get(&key) {
            if entry.0 == generation {
                return entry.1.clone();
            }
        }
        let computed = Arc::new(compute(&self.graph(domain), role));
        memo.insert(key, (generation, computed.clone()));
        computed
    }

    /// Every role `role` inherits from, any number of hops.
    pub fn ancestors(&self, role: &RoleId, domain: &TenantId) -> Arc<BTreeSet<RoleId>> {
        self.closure(&self.ancestors, role, domain, Graph::ancestors)
    }

    /// Every role inheriting from `role`, any number of hops.
    pub fn descendants(&self, role: &RoleId, domain: &TenantId) -> Arc<BTreeSet<RoleId>> {
        self.closure(&self.descendants, role, domain, Graph::descendants)
    }

    /// Makes `child` inherit from `parent`.
    ///
    /// Fails with `CircularDependency` if `parent` already inherits from
    /// `child`, and with `MaxDepthExceeded` if any chain through the new edge
    /// would be longer than the configured max. A rejected edge leaves the
    /// graph unchanged.
    pub fn add_edge(&self, child: &RoleId, parent: &RoleId, domain: &TenantId) -> WardenResult<EdgeChange> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let graph = self.graph(domain);
        let level = 1 + graph.depth_above(parent);

        let descendants = graph.descendants(child);
        if child == parent || descendants.contains(parent) {
            warn!(child = %child, parent = %parent, tenant = %domain, "rejected circular role inheritance");
            return Err(WardenError::CircularDependency {
                child: child.to_string(),
                parent: parent.to_string(),
                domain: domain.to_string(),
            });
        }

        let edge = RoleHierarchyEdge {
            parent: parent.clone(),
            child: child.clone(),
            domain: domain.clone(),
            level,
        };
        let mut affected_roles = descendants;
        affected_roles.insert(child.clone());

        if graph.contains(child, parent) {
            return Ok(EdgeChange { edge, changed: false, affected_roles });
        }

        let deepest = level + graph.depth_below(child);
        if deepest > self.max_depth {
            warn!(child = %child, parent = %parent, tenant = %domain, level = deepest, max = self.max_depth, "rejected role inheritance past max depth");
            return Err(WardenError::MaxDepthExceeded {
                level: deepest,
                max: self.max_depth,
            });
        }

        let changed = self.engine.add_role_inheritance(child, parent, domain)?;
        self.forget(domain);
        info!(child = %child, parent = %parent, tenant = %domain, level, "role inheritance added");
        Ok(EdgeChange { edge, changed, affected_roles })
    }

    /// Removes the edge. Always legal; a missing edge reports `changed == false`.
    pub fn remove_edge(&self, child: &RoleId, parent: &RoleId, domain: &TenantId) -> WardenResult<EdgeChange> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let graph = self.graph(domain);
        let edge = RoleHierarchyEdge {
            parent: parent.clone(),
            child: child.clone(),
            domain: domain.clone(),
            level: 1 + graph.depth_above(parent),
        };
        let mut affected_roles = graph.descendants(child);
        affected_roles.insert(child.clone());

        if !graph.contains(child, parent) {
            return Ok(EdgeChange { edge, changed: false, affected_roles });
        }

        let changed = self.engine.remove_grouping(child.as_str(), parent, domain)?;
        self.forget(domain);
        info!(child = %child, parent = %parent, tenant = %domain, "role inheritance removed");
        Ok(EdgeChange { edge, changed, affected_roles })
    }

    /// Every edge of `domain` with its level.
    pub fn hierarchy(&self, domain: &TenantId) -> Vec<RoleHierarchyEdge> {
        let edges = self.engine.role_edges(domain);
        let graph = Graph::new(&edges);
        let mut memo = HashMap::new();
        edges
            .into_iter()
            .map(|(child, parent)| RoleHierarchyEdge {
                level: 1 + Graph::longest(&graph.parents, &parent, &mut memo),
                parent,
                child,
                domain: domain.clone(),
            })
            .collect()
    }
}
