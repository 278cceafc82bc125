//! Component wiring: store, engine, caches, invalidation bus, issuer.

use std::sync::Arc;

use tracing::{info, warn};

use warden_events::{InMemoryEventBus, InvalidationEvent};
use warden_infra::{
    AdminService, BlockingPool, CacheEvictionHandler, DistributedCache, EngineRefreshHandler,
    InMemoryDistributedCache, InvalidationBus, PermissionPipeline, PostgresPolicyStore, TokenIssuer,
    TokenVerifier, WardenConfig,
};
use warden_policy::{InMemoryPolicyStore, PolicyEngine, PolicyGrowthMonitor, PolicyStore, RoleHierarchyManager};

#[cfg(feature = "redis")]
use warden_infra::{cache::RedisDistributedCache, event_bus::RedisPubSubEventBus};

/// Everything a request handler or background task may reach.
pub struct AppServices {
    pub config: WardenConfig,
    pub engine: Arc<PolicyEngine>,
    pub pool: Arc<BlockingPool>,
    pub pipeline: Arc<PermissionPipeline>,
    pub hierarchy: Arc<RoleHierarchyManager>,
    pub monitor: Arc<PolicyGrowthMonitor>,
    pub bus: Arc<InvalidationBus>,
    pub issuer: Arc<TokenIssuer>,
    pub verifier: Arc<TokenVerifier>,
    pub admin: Arc<AdminService>,
}

impl AppServices {
    /// Connects the backends named by `config`, falling back to in-memory
    /// implementations for anything left unset.
    pub async fn from_config(config: WardenConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn PolicyStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresPolicyStore::connect(url).await?;
                store.ensure_schema().await?;
                info!("policy store: postgres");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; policies are kept in memory and lost on restart");
                Arc::new(InMemoryPolicyStore::new())
            }
        };

        #[cfg(feature = "redis")]
        if let Some(url) = config.redis_url.clone() {
            let cache = RedisDistributedCache::connect(&url).await?;
            let transport = RedisPubSubEventBus::connect(&url).await?;
            info!("shared cache and invalidation transport: redis");
            let bus = InvalidationBus::new(transport, config.instance_id.clone());
            return Self::assemble(config, store, Arc::new(cache), bus).await;
        }

        if config.redis_url.is_some() {
            warn!("REDIS_URL is set but this build lacks the `redis` feature; using in-memory L2");
        } else {
            warn!("REDIS_URL not set; L2 and invalidation are local to this instance");
        }
        let bus = InvalidationBus::new(InMemoryEventBus::<InvalidationEvent>::new(), config.instance_id.clone());
        Self::assemble(config, store, Arc::new(InMemoryDistributedCache::new()), bus).await
    }

    /// Fully in-memory wiring over `store`.
    pub async fn in_memory(config: WardenConfig, store: Arc<dyn PolicyStore>) -> anyhow::Result<Self> {
        let bus = InvalidationBus::new(InMemoryEventBus::<InvalidationEvent>::new(), config.instance_id.clone());
        Self::assemble(config, store, Arc::new(InMemoryDistributedCache::new()), bus).await
    }

    /// Loads every policy into a fresh engine, then builds the components
    /// around it. Returns only once the engine is fully populated.
    pub async fn assemble(
        config: WardenConfig,
        store: Arc<dyn PolicyStore>,
        shared: Arc<dyn DistributedCache>,
        bus: InvalidationBus,
    ) -> anyhow::Result<Self> {
        let pool = Arc::new(BlockingPool::new(config.worker_pool())?);

        let engine = pool.run(move || PolicyEngine::load(store)).await??;
        let engine = Arc::new(engine);
        info!(
            policies = engine.policies().len(),
            groupings = engine.groupings().len(),
            "policy engine loaded"
        );

        let hierarchy = Arc::new(RoleHierarchyManager::with_max_depth(
            engine.clone(),
            config.max_hierarchy_depth,
        ));
        let pipeline = Arc::new(PermissionPipeline::new(
            engine.clone(),
            pool.clone(),
            shared,
            config.pipeline(),
        ));

        let bus = Arc::new(bus);
        bus.register(Arc::new(EngineRefreshHandler::new(
            engine.clone(),
            pool.clone(),
            bus.instance_id().to_string(),
        )));
        bus.register(Arc::new(CacheEvictionHandler::new(pipeline.clone())));

        let monitor = Arc::new(PolicyGrowthMonitor::new(engine.clone(), config.thresholds.clone()));

        let token = config.token();
        let verifier = Arc::new(TokenVerifier::from_config(&token));
        let issuer = Arc::new(TokenIssuer::new(pipeline.clone(), token));

        let admin = Arc::new(AdminService::new(
            hierarchy.clone(),
            pipeline.clone(),
            bus.clone(),
            monitor.clone(),
            issuer.clone(),
        ));

        if let Some((tenant, user)) = &config.bootstrap_admin {
            admin.bootstrap_admin(user, tenant).await?;
        }

        Ok(Self {
            config,
            engine,
            pool,
            pipeline,
            hierarchy,
            monitor,
            bus,
            issuer,
            verifier,
            admin,
        })
    }
}
