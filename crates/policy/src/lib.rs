//! `warden-policy`: the RBAC-with-domains evaluator and everything that
//! reasons about policy content.
//!
//! This crate is decoupled from HTTP, caches and async runtimes. Store IO is
//! synchronous and is expected to run on a blocking worker pool.

pub mod claims;
pub mod engine;
pub mod hierarchy;
pub mod matcher;
pub mod model;
pub mod monitor;
pub mod snapshot;
pub mod store;

pub use claims::{PermissionClaims, TokenValidationError, validate_claims};
pub use engine::PolicyEngine;
pub use hierarchy::{EdgeChange, RoleHierarchyEdge, RoleHierarchyManager};
pub use model::{DomainCounts, PermissionMap, PolicyModel};
pub use monitor::{AlertLevel, GrowthThresholds, LevelTransition, PolicyGrowthMonitor, PolicyStats};
pub use snapshot::{PermissionSnapshot, compress, content_hash};
pub use store::{InMemoryPolicyStore, PolicyStore, StoreError, StoredPolicies};
