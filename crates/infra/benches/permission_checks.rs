use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use warden_core::{RoleId, TenantId, UserId};
use warden_infra::{
    BlockingPool, BlockingPoolConfig, InMemoryDistributedCache, PermissionKey, PermissionPipeline, PipelineConfig,
    TtlCache,
};
use warden_policy::matcher::{action_matches, resource_matches};
use warden_policy::{InMemoryPolicyStore, PolicyEngine};

fn bench_l1_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("l1_lookup");

    for size in [1_000usize, 10_000] {
        let cache: TtlCache<PermissionKey, bool> = TtlCache::new(size, Duration::from_secs(600));
        let tenant = TenantId::new("t1");
        let keys: Vec<PermissionKey> = (0..size)
            .map(|i| PermissionKey::new(&UserId::new(format!("user-{i}")), &tenant, "/docs/42", "GET"))
            .collect();
        for key in &keys {
            cache.insert(key.clone(), true);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(cache.get(&keys[i]))
            })
        });
    }
    group.finish();
}

fn bench_pipeline_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let engine = Arc::new(PolicyEngine::load(Arc::new(InMemoryPolicyStore::new())).unwrap());
    let (editor, tenant) = (RoleId::new("EDITOR"), TenantId::new("t1"));
    engine.add_policy(&editor, &tenant, "/docs/*", "GET|PUT").unwrap();
    engine.add_grouping("alice", &editor, &tenant).unwrap();

    let pool = Arc::new(BlockingPool::new(BlockingPoolConfig::default()).unwrap());
    let pipeline = rt.block_on(async {
        PermissionPipeline::new(engine, pool, Arc::new(InMemoryDistributedCache::new()), PipelineConfig::default())
    });
    let user = UserId::new("alice");
    rt.block_on(pipeline.check_permission(&user, &tenant, "/docs/42", "GET")).unwrap();

    c.bench_function("pipeline_l1_hit", |b| {
        b.iter(|| rt.block_on(pipeline.check_permission(black_box(&user), &tenant, "/docs/42", "GET")))
    });
}

fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");
    group.bench_function("resource_wildcard", |b| {
        b.iter(|| resource_matches(black_box("/api/*/orders/*"), black_box("/api/acme/orders/42")))
    });
    group.bench_function("action_alternation", |b| {
        b.iter(|| action_matches(black_box("(GET|PUT|PATCH|DELETE)"), black_box("delete")))
    });
    group.finish();
}

criterion_group!(benches, bench_l1_lookup, bench_pipeline_hit, bench_matcher);
criterion_main!(benches);
