//! Infrastructure layer: caches, worker pool, invalidation fan-out, token
//! issuance, persistence adapters and configuration.

pub mod admin;
pub mod cache;
pub mod config;
pub mod event_bus;
pub mod invalidation;
pub mod monitor;
pub mod pipeline;
pub mod policy_store;
pub mod token;
pub mod workers;

pub use admin::{AdminService, BOOTSTRAP_ADMIN_ROLE, CapacityCheck, PolicyListing, ResourceGrant};
pub use cache::{CacheError, DistributedCache, InMemoryDistributedCache, PermissionKey, SnapshotKey, TtlCache};
pub use config::WardenConfig;
pub use invalidation::{
    CacheEvictionHandler, EngineRefreshHandler, InvalidationBus, InvalidationHandler, InvalidationStats, RetryPolicy,
};
pub use monitor::{MonitorHandle, spawn_growth_monitor, spawn_policy_resync};
pub use pipeline::{CacheStats, Decision, PermissionPipeline, PipelineConfig, Tier};
pub use policy_store::PostgresPolicyStore;
pub use token::{IssuedToken, TokenConfig, TokenError, TokenIssuer, TokenVerifier};
pub use workers::{BlockingPool, BlockingPoolConfig, PoolError};
