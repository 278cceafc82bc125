//! Permission check pipeline: L1 -> L2 -> policy engine.
//!
//! L1 is a process-local `TtlCache`, L2 the shared `DistributedCache`, L3 the
//! policy engine running on the blocking pool. An unreachable L2 is logged
//! and skipped; a saturated pool surfaces `WorkerPoolSaturated`. Writes to L2
//! are detached and never affect the caller's answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use warden_core::{TenantId, UserId, WardenResult};
use warden_events::{InvalidationEvent, InvalidationType};
use warden_policy::matcher::resource_matches;
use warden_policy::{PermissionSnapshot, PolicyEngine};

use crate::cache::{
    self, DistributedCache, PermissionKey, SnapshotKey, TtlCache, PERMISSION_NAMESPACE, SNAPSHOT_NAMESPACE,
};
use crate::workers::BlockingPool;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub l1_enabled: bool,
    pub l1_max_size: usize,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub snapshot_max_size: usize,
    pub snapshot_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            l1_enabled: true,
            l1_max_size: 10_000,
            l1_ttl: Duration::from_secs(600),
            l2_ttl: Duration::from_secs(300),
            snapshot_max_size: 10_000,
            snapshot_ttl: Duration::from_secs(900),
        }
    }
}

/// Which tier answered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    L3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub tier: Tier,
}

#[derive(Debug, Default)]
struct Counters {
    total_checks: AtomicU64,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
    l3_evaluations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_enabled: bool,
    pub total_checks: u64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    pub l3_evaluations: u64,
    /// Share of checks answered by L1 or L2.
    pub hit_rate: f64,
    pub l1_size: usize,
    pub l1_max_size: usize,
    pub l1_evictions: u64,
    pub snapshot_size: usize,
}

pub struct PermissionPipeline {
    engine: Arc<PolicyEngine>,
    pool: Arc<BlockingPool>,
    l2: Arc<dyn DistributedCache>,
    l1: TtlCache<PermissionKey, bool>,
    snapshots: TtlCache<SnapshotKey, Arc<PermissionSnapshot>>,
    config: PipelineConfig,
    counters: Counters,
}

impl PermissionPipeline {
    pub fn new(
        engine: Arc<PolicyEngine>,
        pool: Arc<BlockingPool>,
        l2: Arc<dyn DistributedCache>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            l1: TtlCache::new(config.l1_max_size, config.l1_ttl),
            snapshots: TtlCache::new(config.snapshot_max_size, config.snapshot_ttl),
            engine,
            pool,
            l2,
            config,
            counters: Counters::default(),
        }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<BlockingPool> {
        &self.pool
    }

    pub fn shared_cache(&self) -> &Arc<dyn DistributedCache> {
        &self.l2
    }

    pub async fn check_permission(
        &self,
        user: &UserId,
        tenant: &TenantId,
        resource: &str,
        action: &str,
    ) -> WardenResult<bool> {
        Ok(self.check_permission_traced(user, tenant, resource, action).await?.allowed)
    }

    pub async fn check_permission_traced(
        &self,
        user: &UserId,
        tenant: &TenantId,
        resource: &str,
        action: &str,
    ) -> WardenResult<Decision> {
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);
        let key = PermissionKey::new(user, tenant, resource, action);

        if self.config.l1_enabled {
            if let Some(allowed) = self.l1.get(&key) {
                self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Decision { allowed, tier: Tier::L1 });
            }
            self.counters.l1_misses.fetch_add(1, Ordering::Relaxed);
        }

        let shared_key = key.shared_key();
        if let Some(raw) = self.l2_get(&shared_key).await {
            match raw.as_str() {
                "1" | "0" => {
                    let allowed = raw == "1";
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    if self.config.l1_enabled {
                        self.l1.insert(key, allowed);
                    }
                    return Ok(Decision { allowed, tier: Tier::L2 });
                }
                other => warn!(key = %shared_key, value = other, "ignoring malformed cached decision"),
            }
        }

        let generation = self.engine.generation();
        let engine = self.engine.clone();
        let (u, t, r, a) = (user.clone(), tenant.clone(), resource.to_string(), key.action.clone());
        let allowed = self
            .pool
            .run(move || engine.enforce(u.as_str(), &t, &r, &a))
            .await?;
        self.counters.l3_evaluations.fetch_add(1, Ordering::Relaxed);

        // A model published mid-evaluation may already have been invalidated; don't cache.
        if self.engine.generation() == generation {
            if self.config.l1_enabled {
                self.l1.insert(key, allowed);
            }
            self.l2_put(shared_key, if allowed { "1" } else { "0" }.to_string());
        }
        Ok(Decision { allowed, tier: Tier::L3 })
    }

    /// The user's effective permissions in `tenant`, through the same tiers.
    pub async fn get_user_permissions(
        &self,
        user: &UserId,
        tenant: &TenantId,
    ) -> WardenResult<Arc<PermissionSnapshot>> {
        let key = SnapshotKey::new(user, tenant);
        if let Some(snapshot) = self.snapshots.get(&key) {
            return Ok(snapshot);
        }

        let shared_key = key.shared_key();
        if let Some(raw) = self.l2_get(&shared_key).await {
            match serde_json::from_str::<PermissionSnapshot>(&raw) {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.snapshots.insert(key, snapshot.clone());
                    return Ok(snapshot);
                }
                Err(e) => warn!(key = %shared_key, error = %e, "ignoring malformed cached snapshot"),
            }
        }

        let generation = self.engine.generation();
        let engine = self.engine.clone();
        let (u, t) = (user.clone(), tenant.clone());
        let snapshot = self
            .pool
            .run(move || PermissionSnapshot {
                permissions: engine.implicit_permissions(u.as_str(), &t),
                roles: engine.roles_for(u.as_str(), &t),
                user_id: u,
                tenant_id: t,
                computed_at: Utc::now(),
            })
            .await?;
        let snapshot = Arc::new(snapshot);

        if self.engine.generation() == generation {
            self.snapshots.insert(key, snapshot.clone());
            match serde_json::to_string(snapshot.as_ref()) {
                Ok(json) => self.l2_put_with_ttl(shared_key, json, self.config.snapshot_ttl),
                Err(e) => warn!(error = %e, "failed to encode snapshot for shared cache"),
            }
        }
        Ok(snapshot)
    }

    async fn l2_get(&self, key: &str) -> Option<String> {
        match self.l2.get(key).await {
            Ok(Some(raw)) => Some(raw),
            Ok(None) => {
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "shared cache unavailable, falling through to policy engine");
                None
            }
        }
    }

    fn l2_put(&self, key: String, value: String) {
        self.l2_put_with_ttl(key, value, self.config.l2_ttl);
    }

    fn l2_put_with_ttl(&self, key: String, value: String, ttl: Duration) {
        let l2 = self.l2.clone();
        tokio::spawn(async move {
            if let Err(e) = l2.set(&key, &value, ttl).await {
                debug!(key = %key, error = %e, "shared cache write failed");
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Evicts the process-local entries an event covers. Idempotent.
    pub fn evict(&self, event: &InvalidationEvent) -> usize {
        let tenant = event.tenant_id.as_ref();
        let in_tenant = |t: &TenantId| tenant.is_none_or(|scope| scope == t);

        match event.kind {
            InvalidationType::User => match &event.user_id {
                Some(user) => {
                    self.l1.invalidate_if(|k| &k.user == user && in_tenant(&k.tenant))
                        + self.snapshots.invalidate_if(|k| &k.user == user && in_tenant(&k.tenant))
                }
                None => self.evict_everything(event),
            },
            InvalidationType::Tenant | InvalidationType::Role => match tenant {
                Some(tenant) => self.evict_tenant(tenant),
                None => self.evict_everything(event),
            },
            InvalidationType::Resource => match &event.resource {
                Some(resource) => {
                    self.l1.invalidate_if(|k| {
                        in_tenant(&k.tenant) && (&k.resource == resource || resource_matches(resource, &k.resource))
                    }) + self.snapshots.invalidate_if(|k| in_tenant(&k.tenant))
                }
                None => self.evict_everything(event),
            },
            InvalidationType::Permission => match (&event.user_id, tenant) {
                (Some(user), Some(tenant)) => {
                    let action = event.action.as_deref().map(warden_policy::matcher::normalize_action);
                    let evicted = self.l1.invalidate_if(|k| {
                        &k.user == user
                            && &k.tenant == tenant
                            && event.resource.as_ref().is_none_or(|r| &k.resource == r)
                            && action.as_ref().is_none_or(|a| &k.action == a)
                    });
                    evicted + usize::from(self.snapshots.invalidate(&SnapshotKey::new(user, tenant)))
                }
                _ => self.evict_everything(event),
            },
            InvalidationType::Wildcard => self.evict_everything(event),
        }
    }

    fn evict_tenant(&self, tenant: &TenantId) -> usize {
        self.l1.invalidate_if(|k| &k.tenant == tenant) + self.snapshots.invalidate_if(|k| &k.tenant == tenant)
    }

    fn evict_everything(&self, event: &InvalidationEvent) -> usize {
        if event.kind != InvalidationType::Wildcard {
            warn!(kind = ?event.kind, event_id = %event.event_id, "invalidation without scope, clearing local caches");
        }
        let n = self.l1.len() + self.snapshots.len();
        self.clear_local();
        n
    }

    /// Deletes the shared-cache keys an event covers. Failures are logged.
    pub async fn evict_shared(&self, event: &InvalidationEvent) {
        let tenant = event.tenant_id.as_ref();
        let mut prefixes: Vec<String> = Vec::new();
        let mut keys: Vec<String> = Vec::new();

        match (event.kind, tenant, &event.user_id) {
            (InvalidationType::User, Some(t), Some(u)) => {
                prefixes.push(cache::user_permission_prefix(t, u));
                keys.push(SnapshotKey::new(u, t).shared_key());
            }
            (InvalidationType::Permission, Some(t), Some(u)) => match (&event.resource, &event.action) {
                (Some(resource), Some(action)) => {
                    keys.push(PermissionKey::new(u, t, resource, action).shared_key());
                    keys.push(SnapshotKey::new(u, t).shared_key());
                }
                _ => {
                    prefixes.push(cache::user_permission_prefix(t, u));
                    keys.push(SnapshotKey::new(u, t).shared_key());
                }
            },
            (InvalidationType::Wildcard, _, _) | (_, None, _) => {
                prefixes.push(format!("{PERMISSION_NAMESPACE}:"));
                prefixes.push(format!("{SNAPSHOT_NAMESPACE}:"));
            }
            (_, Some(t), _) => {
                prefixes.push(cache::tenant_permission_prefix(t));
                prefixes.push(cache::tenant_snapshot_prefix(t));
            }
        }

        for prefix in prefixes {
            if let Err(e) = self.l2.delete_prefix(&prefix).await {
                warn!(prefix = %prefix, error = %e, "shared cache eviction failed; entries expire by TTL");
            }
        }
        for key in keys {
            if let Err(e) = self.l2.delete(&key).await {
                warn!(key = %key, error = %e, "shared cache eviction failed; entry expires by TTL");
            }
        }
    }

    /// Reloads the engine from the store and, for every domain that turned
    /// out to be stale, drops the local and shared entries computed from it.
    /// Returns the stale domains.
    pub async fn resync(&self) -> WardenResult<Vec<TenantId>> {
        let engine = self.engine.clone();
        let changed = self.pool.run(move || engine.resync()).await??;
        for tenant in &changed {
            let evicted = self.evict_tenant(tenant);
            warn!(tenant_id = %tenant, evicted, "policy domain was stale, caches dropped");
            self.evict_shared(&InvalidationEvent::tenant(tenant.clone(), "policy resync")).await;
        }
        Ok(changed)
    }

    pub fn clear_local(&self) {
        self.l1.clear();
        self.snapshots.clear();
    }

    pub fn clear_user(&self, user: &UserId, tenant: Option<&TenantId>) -> usize {
        self.evict(&InvalidationEvent::user(user.clone(), tenant.cloned(), "cache cleared"))
    }

    pub fn clear_tenant(&self, tenant: &TenantId) -> usize {
        self.evict_tenant(tenant)
    }

    /// Role membership is not part of the cache key, so a role clear drops
    /// its whole tenant.
    pub fn clear_role(&self, tenant: Option<&TenantId>) -> usize {
        match tenant {
            Some(t) => self.evict_tenant(t),
            None => {
                let n = self.l1.len() + self.snapshots.len();
                self.clear_local();
                n
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let total = c.total_checks.load(Ordering::Relaxed);
        let l1_hits = c.l1_hits.load(Ordering::Relaxed);
        let l2_hits = c.l2_hits.load(Ordering::Relaxed);
        let hit_rate = if total == 0 {
            0.0
        } else {
            (l1_hits + l2_hits) as f64 / total as f64
        };

        CacheStats {
            l1_enabled: self.config.l1_enabled,
            total_checks: total,
            l1_hits,
            l1_misses: c.l1_misses.load(Ordering::Relaxed),
            l2_hits,
            l2_misses: c.l2_misses.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            l3_evaluations: c.l3_evaluations.load(Ordering::Relaxed),
            hit_rate,
            l1_size: self.l1.len(),
            l1_max_size: self.l1.max_size(),
            l1_evictions: self.l1.evictions(),
            snapshot_size: self.snapshots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Barrier;

    use warden_core::{RoleId, WardenError};
    use warden_policy::InMemoryPolicyStore;

    use crate::cache::InMemoryDistributedCache;
    use crate::workers::BlockingPoolConfig;

    struct Fixture {
        engine: Arc<PolicyEngine>,
        l2: Arc<InMemoryDistributedCache>,
        pool: Arc<BlockingPool>,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(PolicyEngine::load(Arc::new(InMemoryPolicyStore::new())).unwrap());
        let (editor, t1) = (RoleId::new("EDITOR"), TenantId::new("t1"));
        engine.add_policy(&editor, &t1, "/docs/*", "GET|PUT").unwrap();
        engine.add_grouping("alice", &editor, &t1).unwrap();

        Fixture {
            engine,
            l2: Arc::new(InMemoryDistributedCache::new()),
            pool: Arc::new(BlockingPool::new(BlockingPoolConfig::default().with_threads(2)).unwrap()),
        }
    }

    fn pipeline(f: &Fixture, config: PipelineConfig) -> PermissionPipeline {
        PermissionPipeline::new(f.engine.clone(), f.pool.clone(), f.l2.clone(), config)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn alice() -> (UserId, TenantId) {
        (UserId::new("alice"), TenantId::new("t1"))
    }

    #[tokio::test]
    async fn first_check_evaluates_then_hits_l1() {
        let f = fixture();
        let p = pipeline(&f, PipelineConfig::default());
        let (u, t) = alice();

        let first = p.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
        assert_eq!(first, Decision { allowed: true, tier: Tier::L3 });

        let second = p.check_permission_traced(&u, &t, "/docs/42", "get").await.unwrap();
        assert_eq!(second, Decision { allowed: true, tier: Tier::L1 });

        assert!(!p.check_permission(&u, &t, "/docs/42", "DELETE").await.unwrap());

        let stats = p.stats();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l3_evaluations, 2);
        assert_eq!(stats.l1_size, 2);
    }

    #[tokio::test]
    async fn shared_tier_serves_other_instances() {
        let f = fixture();
        let (u, t) = alice();
        let a = pipeline(&f, PipelineConfig::default());
        let b = pipeline(&f, PipelineConfig::default());

        a.check_permission(&u, &t, "/docs/42", "GET").await.unwrap();
        settle().await;

        let from_b = b.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
        assert_eq!(from_b, Decision { allowed: true, tier: Tier::L2 });
        let again = b.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
        assert_eq!(again.tier, Tier::L1);
    }

    #[tokio::test]
    async fn unreachable_shared_tier_degrades_to_engine() {
        let f = fixture();
        f.l2.set_unavailable(true);
        let p = pipeline(&f, PipelineConfig::default());
        let (u, t) = alice();

        let decision = p.check_permission_traced(&u, &t, "/docs/42", "PUT").await.unwrap();
        assert_eq!(decision, Decision { allowed: true, tier: Tier::L3 });
        assert_eq!(p.stats().l2_errors, 1);
    }

    #[tokio::test]
    async fn disabled_l1_always_consults_the_lower_tiers() {
        let f = fixture();
        let p = pipeline(
            &f,
            PipelineConfig {
                l1_enabled: false,
                ..PipelineConfig::default()
            },
        );
        let (u, t) = alice();

        p.check_permission(&u, &t, "/docs/42", "GET").await.unwrap();
        settle().await;
        let second = p.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
        assert_eq!(second.tier, Tier::L2);
        assert_eq!(p.stats().l1_size, 0);
    }

    #[tokio::test]
    async fn user_event_evicts_only_that_user() {
        let f = fixture();
        f.engine.add_grouping("bob", &RoleId::new("EDITOR"), &TenantId::new("t1")).unwrap();
        let p = pipeline(&f, PipelineConfig::default());
        let (alice, t) = alice();
        let bob = UserId::new("bob");

        p.check_permission(&alice, &t, "/docs/1", "GET").await.unwrap();
        p.check_permission(&bob, &t, "/docs/1", "GET").await.unwrap();

        let event = InvalidationEvent::user(alice.clone(), Some(t.clone()), "test");
        assert_eq!(p.evict(&event), 1);
        // Replaying is harmless.
        assert_eq!(p.evict(&event), 0);

        assert_eq!(p.check_permission_traced(&bob, &t, "/docs/1", "GET").await.unwrap().tier, Tier::L1);
    }

    #[tokio::test]
    async fn resource_event_evicts_matching_resources() {
        let f = fixture();
        let p = pipeline(&f, PipelineConfig::default());
        let (u, t) = alice();

        p.check_permission(&u, &t, "/docs/1", "GET").await.unwrap();
        p.check_permission(&u, &t, "/docs/2", "GET").await.unwrap();
        p.check_permission(&u, &t, "/reports/1", "GET").await.unwrap();

        let evicted = p.evict(&InvalidationEvent::resource("/docs/*", Some(t.clone()), "test"));
        assert_eq!(evicted, 2);
        assert_eq!(p.stats().l1_size, 1);
    }

    #[tokio::test]
    async fn wildcard_event_clears_everything() {
        let f = fixture();
        let p = pipeline(&f, PipelineConfig::default());
        let (u, t) = alice();

        p.check_permission(&u, &t, "/docs/1", "GET").await.unwrap();
        p.get_user_permissions(&u, &t).await.unwrap();
        p.evict(&InvalidationEvent::wildcard("test"));

        let stats = p.stats();
        assert_eq!(stats.l1_size, 0);
        assert_eq!(stats.snapshot_size, 0);
    }

    #[tokio::test]
    async fn snapshot_is_cached_and_shared() {
        let f = fixture();
        let (u, t) = alice();
        let a = pipeline(&f, PipelineConfig::default());

        let snapshot = a.get_user_permissions(&u, &t).await.unwrap();
        assert!(snapshot.roles.contains(&RoleId::new("EDITOR")));
        assert!(snapshot.permissions["/docs/*"].contains("GET"));
        let again = a.get_user_permissions(&u, &t).await.unwrap();
        assert!(Arc::ptr_eq(&snapshot, &again));

        settle().await;
        let b = pipeline(&f, PipelineConfig::default());
        let from_b = b.get_user_permissions(&u, &t).await.unwrap();
        assert_eq!(from_b.permissions, snapshot.permissions);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saturated_pool_fails_fast() {
        let f = fixture();
        let pool = Arc::new(
            BlockingPool::new(
                BlockingPoolConfig::default()
                    .with_threads(1)
                    .with_queue_capacity(0)
                    .with_dispatch_wait(Duration::from_millis(10)),
            )
            .unwrap(),
        );
        let p = PermissionPipeline::new(f.engine.clone(), pool.clone(), f.l2.clone(), PipelineConfig::default());

        let gate = Arc::new(Barrier::new(2));
        let held = gate.clone();
        let blocker = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(move || held.wait()).await }
        });
        while pool.stats().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let (u, t) = alice();
        let err = p.check_permission(&u, &t, "/docs/1", "GET").await.unwrap_err();
        assert!(matches!(err, WardenError::WorkerPoolSaturated));

        gate.wait();
        blocker.await.unwrap().unwrap();
    }
}
