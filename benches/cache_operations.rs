//! Benchmarks for basic cache operations
//!
//! This benchmark suite measures the performance of:
//! - Page key derivation (route normalization and variation fingerprints)
//! - Memory store writes and hits across payload sizes
//! - Tenant-scoped tag purges

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use multi_tenant_cache::config::{NamespaceSalt, PageStoreConfig, VariationConfig};
use multi_tenant_cache::{
    CacheKeyBuilder, PageCacheStore, TenantContext, Ttl, Variation,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::runtime::Runtime;

fn tenant() -> TenantContext {
    TenantContext::for_tenant("acme").unwrap_or_else(|_| panic!("Invalid tenant id"))
}

fn keys() -> CacheKeyBuilder {
    let mut axes = VariationConfig::default();
    axes.query_param_whitelist = vec!["page".into(), "sort".into()];
    CacheKeyBuilder::new(axes, &PageStoreConfig::default(), NamespaceSalt::default())
}

fn setup_store() -> (PageCacheStore, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let store = PageCacheStore::in_memory(&PageStoreConfig::default(), Duration::from_secs(1));
    (store, rt)
}

fn tags(id: u32) -> BTreeSet<String> {
    [format!("product:{id}"), "catalog".to_string()].into_iter().collect()
}

/// Benchmark key derivation with and without whitelisted query params
fn bench_key_building(c: &mut Criterion) {
    let keys = keys();
    let tenant = tenant();
    let plain = Variation::new("mobile", "en");
    let noisy = Variation::new("mobile", "en")
        .with_query("sort", "price")
        .with_query("page", "3")
        .with_query("utm_source", "newsletter");

    let mut group = c.benchmark_group("key_building");
    group.bench_function("plain", |b| {
        b.iter(|| black_box(keys.page_key(&tenant, black_box("/products/42"), &plain)));
    });
    group.bench_function("query_params", |b| {
        b.iter(|| black_box(keys.page_key(&tenant, black_box("/products/?page=3"), &noisy)));
    });
    group.finish();
}

/// Benchmark page writes across payload sizes
fn bench_page_set(c: &mut Criterion) {
    let (store, rt) = setup_store();
    let keys = keys();
    let tenant = tenant();
    let variation = Variation::new("desktop", "en");

    let mut group = c.benchmark_group("page_set");
    for size in &[1024, 10_240, 102_400] {
        let payload = Bytes::from("x".repeat(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let id = rand::random::<u32>() % 1_000;
                    let key = keys.page_key(&tenant, &format!("/products/{id}"), &variation);
                    black_box(
                        store
                            .put(&key, payload.clone(), Ttl::from_secs(300), tags(id))
                            .await
                            .unwrap_or_else(|_| panic!("Failed to store page")),
                    )
                });
            });
        });
    }
    group.finish();
}

/// Benchmark page hits
fn bench_page_hit(c: &mut Criterion) {
    let (store, rt) = setup_store();
    let keys = keys();
    let tenant = tenant();
    let variation = Variation::new("desktop", "en");

    let hot: Vec<_> = (0..100)
        .map(|id| keys.page_key(&tenant, &format!("/products/{id}"), &variation))
        .collect();
    rt.block_on(async {
        for (id, key) in (0u32..).zip(&hot) {
            store
                .put(key, Bytes::from("x".repeat(4096)), Ttl::from_secs(300), tags(id))
                .await
                .unwrap_or_else(|_| panic!("Failed to warm page"));
        }
    });

    c.bench_function("page_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                let key = &hot[usize::from(rand::random::<u8>() % 100)];
                black_box(store.get(key).await)
            });
        });
    });
}

/// Benchmark purging one tag out of a warmed namespace
fn bench_tag_purge(c: &mut Criterion) {
    let (store, rt) = setup_store();
    let keys = keys();
    let tenant = tenant();
    let variation = Variation::new("desktop", "en");

    c.bench_function("tag_purge", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = rand::random::<u32>() % 100;
                let key = keys.page_key(&tenant, &format!("/products/{id}"), &variation);
                store
                    .put(&key, Bytes::from_static(b"page"), Ttl::from_secs(300), tags(id))
                    .await
                    .unwrap_or_else(|_| panic!("Failed to store page"));
                black_box(
                    store
                        .purge_by_tag(&tenant, &format!("product:{id}"))
                        .await
                        .unwrap_or_else(|_| panic!("Failed to purge tag")),
                )
            });
        });
    });
}

criterion_group!(
    benches,
    bench_key_building,
    bench_page_set,
    bench_page_hit,
    bench_tag_purge
);
criterion_main!(benches);
