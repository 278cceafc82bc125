//! Two instances sharing a policy store, a shared cache and a bus transport.

use std::sync::Arc;
use std::time::Duration;

use warden_core::{Effect, RoleId, TenantId, UserId};
use warden_events::{InMemoryEventBus, InvalidationEvent};
use warden_infra::{
    AdminService, BlockingPool, BlockingPoolConfig, CacheEvictionHandler, EngineRefreshHandler,
    InMemoryDistributedCache, InvalidationBus, PermissionPipeline, PipelineConfig, Tier, TokenConfig, TokenIssuer,
    spawn_policy_resync,
};
use warden_policy::{GrowthThresholds, InMemoryPolicyStore, PolicyEngine, PolicyGrowthMonitor, RoleHierarchyManager};

struct Instance {
    pipeline: Arc<PermissionPipeline>,
    bus: Arc<InvalidationBus>,
    admin: AdminService,
}

fn instance(
    id: &str,
    store: Arc<InMemoryPolicyStore>,
    l2: Arc<InMemoryDistributedCache>,
    transport: Arc<InMemoryEventBus<InvalidationEvent>>,
    config: PipelineConfig,
) -> Instance {
    let engine = Arc::new(PolicyEngine::load(store).unwrap());
    let pool = Arc::new(BlockingPool::new(BlockingPoolConfig::default().with_threads(2).with_name(id)).unwrap());
    let pipeline = Arc::new(PermissionPipeline::new(engine.clone(), pool.clone(), l2, config));

    let bus = Arc::new(InvalidationBus::new(transport, id));
    bus.register(Arc::new(EngineRefreshHandler::new(engine.clone(), pool, id)));
    bus.register(Arc::new(CacheEvictionHandler::new(pipeline.clone())));
    bus.start();

    let admin = AdminService::new(
        Arc::new(RoleHierarchyManager::new(engine.clone())),
        pipeline.clone(),
        bus.clone(),
        Arc::new(PolicyGrowthMonitor::new(engine, GrowthThresholds::default())),
        Arc::new(TokenIssuer::new(pipeline.clone(), TokenConfig::default())),
    );
    Instance { pipeline, bus, admin }
}

fn fleet() -> (Instance, Instance) {
    let (a, b, _) = fleet_with(PipelineConfig::default());
    (a, b)
}

fn fleet_with(config: PipelineConfig) -> (Instance, Instance, Arc<InMemoryEventBus<InvalidationEvent>>) {
    let store = Arc::new(InMemoryPolicyStore::new());
    let l2 = Arc::new(InMemoryDistributedCache::new());
    let transport = Arc::new(InMemoryEventBus::new());
    (
        instance("node-a", store.clone(), l2.clone(), transport.clone(), config.clone()),
        instance("node-b", store, l2, transport.clone(), config),
        transport,
    )
}

async fn wait_for_handled(bus: &InvalidationBus, at_least: u64) {
    for _ in 0..200 {
        if bus.stats().handled >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("invalidation not handled: {:?}", bus.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_invalidation_forces_fresh_evaluation_on_every_instance() {
    let (a, b) = fleet();
    let (u, t, editor) = (UserId::new("u"), TenantId::new("tenant1"), RoleId::new("EDITOR"));

    a.admin.add_policy(&editor, &t, "/docs/*", "GET|PUT", Effect::Allow).await.unwrap();
    a.admin.assign_role(&u, &editor, &t).await.unwrap();
    wait_for_handled(&b.bus, 2).await;

    assert!(b.pipeline.check_permission(&u, &t, "/docs/42", "GET").await.unwrap());
    let cached = b.pipeline.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
    assert_eq!(cached.tier, Tier::L1);
    // Let the detached shared-cache write land before evicting it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let before = b.bus.stats().handled;
    a.admin.clear_cache_for_user(&u, Some(&t)).await;
    wait_for_handled(&b.bus, before + 1).await;

    let after = b.pipeline.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
    assert_eq!(after.tier, Tier::L3);
    assert!(after.allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_grant_reloads_the_receiving_engine() {
    let (a, b) = fleet();
    let (u, t, viewer) = (UserId::new("u"), TenantId::new("tenant1"), RoleId::new("VIEWER"));

    assert!(!b.pipeline.check_permission(&u, &t, "/reports/1", "GET").await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    a.admin.add_policy(&viewer, &t, "/reports/*", "GET", Effect::Allow).await.unwrap();
    a.admin.assign_role(&u, &viewer, &t).await.unwrap();
    wait_for_handled(&b.bus, 2).await;

    assert!(b.pipeline.check_permission(&u, &t, "/reports/1", "GET").await.unwrap());
    assert!(!b.pipeline.check_permission(&u, &t, "/reports/1", "DELETE").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn own_events_are_not_processed_twice() {
    let (a, _b) = fleet();
    a.admin.clear_cache().await;

    for _ in 0..100 {
        if a.bus.stats().duplicates >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = a.bus.stats();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_converges_within_a_ttl_when_delivery_fails() {
    let ttl = Duration::from_millis(100);
    let config = PipelineConfig {
        l1_ttl: ttl,
        l2_ttl: ttl,
        snapshot_ttl: ttl,
        ..PipelineConfig::default()
    };
    let (a, b, transport) = fleet_with(config);
    let (u, t, editor) = (UserId::new("u"), TenantId::new("tenant1"), RoleId::new("EDITOR"));

    a.admin.add_policy(&editor, &t, "/docs/*", "GET", Effect::Allow).await.unwrap();
    a.admin.assign_role(&u, &editor, &t).await.unwrap();
    wait_for_handled(&b.bus, 2).await;
    assert!(b.pipeline.check_permission(&u, &t, "/docs/42", "GET").await.unwrap());
    assert!(a.pipeline.check_permission(&u, &t, "/docs/42", "GET").await.unwrap());

    let resync_a = spawn_policy_resync(a.pipeline.clone(), ttl);
    let resync_b = spawn_policy_resync(b.pipeline.clone(), ttl);

    transport.fail_next(100);
    let handled_before = b.bus.stats().handled;
    a.admin.revoke_role(&u, &editor, &t).await.unwrap();
    tokio::time::sleep(4 * ttl).await;

    assert_eq!(b.bus.stats().handled, handled_before);
    let from_b = b.pipeline.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
    assert!(!from_b.allowed, "node-b still allows after {from_b:?}");
    let from_a = a.pipeline.check_permission_traced(&u, &t, "/docs/42", "GET").await.unwrap();
    assert!(!from_a.allowed, "node-a reads a stale grant: {from_a:?}");

    resync_a.shutdown().await;
    resync_b.shutdown().await;
}
