//! Process configuration.
//!
//! Loaded from `WARDEN_*` environment variables with development defaults.
//! Unparsable values fall back to the default with a warning.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use warden_core::{TenantId, UserId};
use warden_policy::GrowthThresholds;

use crate::pipeline::PipelineConfig;
use crate::token::TokenConfig;
use crate::workers::BlockingPoolConfig;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone)]
pub struct WardenConfig {
    // ── caches ──────────────────────────────────────────────────────────────
    pub l1_enabled: bool,
    pub l1_max_size: usize,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub snapshot_ttl: Duration,
    /// How often the engine is resynced from the store. Capped at the
    /// shorter of the L1 and L2 TTLs.
    pub policy_resync_interval: Duration,

    // ── blocking pool ───────────────────────────────────────────────────────
    pub worker_threads: usize,
    pub worker_queue: usize,
    pub worker_dispatch_wait: Duration,

    // ── edge filters ────────────────────────────────────────────────────────
    /// Tokens added to a rate-limit bucket per second.
    pub rate_replenish: u32,
    pub rate_burst: u32,
    pub response_ttl: Duration,
    pub coalesce_window: Duration,
    pub coalesce_max_wait: Duration,
    /// Uppercase HTTP methods eligible for coalescing.
    pub coalesce_methods: Vec<String>,

    // ── growth monitor / hierarchy ──────────────────────────────────────────
    pub thresholds: GrowthThresholds,
    pub monitor_interval: Duration,
    pub max_hierarchy_depth: usize,

    // ── tokens ──────────────────────────────────────────────────────────────
    pub token_validity: Duration,
    pub token_issuer: String,
    pub permission_compression: bool,
    pub jwt_secret: String,
    /// `tenant:user` granted full access at startup (`WARDEN_BOOTSTRAP_ADMIN`).
    pub bootstrap_admin: Option<(TenantId, UserId)>,

    // ── wiring ──────────────────────────────────────────────────────────────
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub instance_id: String,
    pub bind: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            l1_enabled: true,
            l1_max_size: 10_000,
            l1_ttl: Duration::from_secs(600),
            l2_ttl: Duration::from_secs(300),
            snapshot_ttl: Duration::from_secs(900),
            policy_resync_interval: Duration::from_secs(60),
            worker_threads: 8,
            worker_queue: 1024,
            worker_dispatch_wait: Duration::from_millis(50),
            rate_replenish: 100,
            rate_burst: 200,
            response_ttl: Duration::from_secs(60),
            coalesce_window: Duration::from_millis(100),
            coalesce_max_wait: Duration::from_millis(500),
            coalesce_methods: vec!["GET".to_string(), "HEAD".to_string()],
            thresholds: GrowthThresholds::default(),
            monitor_interval: Duration::from_secs(300),
            max_hierarchy_depth: warden_policy::hierarchy::DEFAULT_MAX_DEPTH,
            token_validity: Duration::from_secs(900),
            token_issuer: "warden-iam".to_string(),
            permission_compression: true,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            bootstrap_admin: None,
            redis_url: None,
            database_url: None,
            instance_id: Uuid::now_v7().to_string(),
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl WardenConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let thresholds = GrowthThresholds {
            warning: parse(&get, "WARDEN_POLICY_WARNING", d.thresholds.warning),
            critical: parse(&get, "WARDEN_POLICY_CRITICAL", d.thresholds.critical),
            emergency: parse(&get, "WARDEN_POLICY_EMERGENCY", d.thresholds.emergency),
            max_per_tenant: parse(&get, "WARDEN_MAX_POLICIES_PER_TENANT", d.thresholds.max_per_tenant),
            max_per_role: parse(&get, "WARDEN_MAX_POLICIES_PER_ROLE", d.thresholds.max_per_role),
        };

        let coalesce_methods = get("WARDEN_COALESCE_METHODS")
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_ascii_uppercase())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or(d.coalesce_methods);

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            d.jwt_secret
        });

        let l1_ttl = secs(&get, "WARDEN_L1_TTL_SECS", d.l1_ttl);
        let l2_ttl = secs(&get, "WARDEN_L2_TTL_SECS", d.l2_ttl);
        let policy_resync_interval = resync_interval(
            secs(&get, "WARDEN_POLICY_RESYNC_SECS", d.policy_resync_interval),
            l1_ttl.min(l2_ttl),
        );

        Self {
            l1_enabled: flag(&get, "WARDEN_L1_ENABLED", d.l1_enabled),
            l1_max_size: parse(&get, "WARDEN_L1_MAX_SIZE", d.l1_max_size),
            l1_ttl,
            l2_ttl,
            snapshot_ttl: secs(&get, "WARDEN_SNAPSHOT_TTL_SECS", d.snapshot_ttl),
            policy_resync_interval,
            worker_threads: parse(&get, "WARDEN_WORKER_THREADS", d.worker_threads),
            worker_queue: parse(&get, "WARDEN_WORKER_QUEUE", d.worker_queue),
            worker_dispatch_wait: millis(&get, "WARDEN_WORKER_DISPATCH_WAIT_MS", d.worker_dispatch_wait),
            rate_replenish: parse(&get, "WARDEN_RATE_REPLENISH", d.rate_replenish),
            rate_burst: parse(&get, "WARDEN_RATE_BURST", d.rate_burst),
            response_ttl: secs(&get, "WARDEN_RESPONSE_TTL_SECS", d.response_ttl),
            coalesce_window: millis(&get, "WARDEN_COALESCE_WINDOW_MS", d.coalesce_window),
            coalesce_max_wait: millis(&get, "WARDEN_COALESCE_MAX_WAIT_MS", d.coalesce_max_wait),
            coalesce_methods,
            thresholds,
            monitor_interval: secs(&get, "WARDEN_MONITOR_INTERVAL_SECS", d.monitor_interval),
            max_hierarchy_depth: parse(&get, "WARDEN_MAX_HIERARCHY_DEPTH", d.max_hierarchy_depth),
            token_validity: secs(&get, "WARDEN_TOKEN_VALIDITY_SECS", d.token_validity),
            token_issuer: get("WARDEN_TOKEN_ISSUER").unwrap_or(d.token_issuer),
            permission_compression: flag(&get, "WARDEN_PERMISSION_COMPRESSION", d.permission_compression),
            jwt_secret,
            bootstrap_admin: get("WARDEN_BOOTSTRAP_ADMIN").and_then(|raw| principal(&raw)),
            redis_url: get("REDIS_URL"),
            database_url: get("DATABASE_URL"),
            instance_id: get("WARDEN_INSTANCE_ID").unwrap_or(d.instance_id),
            bind: get("WARDEN_BIND").unwrap_or(d.bind),
        }
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            l1_enabled: self.l1_enabled,
            l1_max_size: self.l1_max_size,
            l1_ttl: self.l1_ttl,
            l2_ttl: self.l2_ttl,
            snapshot_max_size: self.l1_max_size,
            snapshot_ttl: self.snapshot_ttl,
        }
    }

    pub fn worker_pool(&self) -> BlockingPoolConfig {
        BlockingPoolConfig::default()
            .with_threads(self.worker_threads)
            .with_queue_capacity(self.worker_queue)
            .with_dispatch_wait(self.worker_dispatch_wait)
    }

    pub fn token(&self) -> TokenConfig {
        TokenConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.token_issuer.clone(),
            validity: self.token_validity,
            compression: self.permission_compression,
        }
    }
}

fn principal(raw: &str) -> Option<(TenantId, UserId)> {
    let parsed: Option<(TenantId, UserId)> = raw
        .split_once(':')
        .and_then(|(tenant, user)| Some((tenant.parse().ok()?, user.parse().ok()?)));
    if parsed.is_none() {
        warn!(key = "WARDEN_BOOTSTRAP_ADMIN", value = %raw, "expected `tenant:user`, ignoring");
    }
    parsed
}

fn resync_interval(requested: Duration, shortest_ttl: Duration) -> Duration {
    let floor = Duration::from_secs(1);
    if requested > shortest_ttl {
        warn!(
            requested_secs = requested.as_secs(),
            capped_secs = shortest_ttl.as_secs(),
            "policy resync interval exceeds cache TTL, capping"
        );
    }
    requested.min(shortest_ttl).max(floor)
}

fn parse<T: FromStr + Copy>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparsable config value, using default");
            default
        }),
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => default,
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
        Some(v) => {
            warn!(key, value = %v, "unparsable config flag, using default");
            default
        }
    }
}

fn secs(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse(get, key, default.as_secs()))
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse(get, key, default.as_millis() as u64))
}
