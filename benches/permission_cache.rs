//! Benchmarks for the permission cache hot paths
//!
//! This benchmark suite measures the performance of:
//! - Cache key construction
//! - Cached check (read-through hit)
//! - Batch check deduplication with a warm cache
//! - Write-behind buffering

use anyhow::Result;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rebac_cache::backends::DashMapStore;
use rebac_cache::batching::{build_batch_check_keys, build_cache_key};
use rebac_cache::{
    AuthorizationBackend, CacheConfig, PermissionTuple, ReadThroughCache, WriteBehindCache,
    WriteBehindConfig, async_trait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Backend that grants every even-numbered object
struct StaticBackend;

fn granted(tuple: &PermissionTuple) -> bool {
    tuple
        .object
        .rsplit(':')
        .next()
        .and_then(|id| id.parse::<u64>().ok())
        .is_some_and(|id| id % 2 == 0)
}

#[async_trait]
impl AuthorizationBackend for StaticBackend {
    async fn check(
        &self,
        tuple: &PermissionTuple,
        _contextual_tuples: &[PermissionTuple],
        _context: Option<&serde_json::Value>,
    ) -> Result<bool> {
        Ok(granted(tuple))
    }

    async fn batch_check(&self, checks: &[PermissionTuple]) -> Result<Vec<bool>> {
        Ok(checks.iter().map(granted).collect())
    }

    async fn list_objects(
        &self,
        _user: &str,
        _relation: &str,
        _object_type: &str,
        _contextual_tuples: &[PermissionTuple],
        _context: Option<&serde_json::Value>,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn write(&self, _writes: &[PermissionTuple], _deletes: &[PermissionTuple]) -> Result<()> {
        Ok(())
    }
}

/// Setup read-through cache for benchmarks
fn setup_cache(config: CacheConfig) -> (Arc<ReadThroughCache>, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let cache = ReadThroughCache::new(Arc::new(StaticBackend), Arc::new(DashMapStore::new()), config)
        .unwrap_or_else(|_| panic!("Failed to create cache"));
    (Arc::new(cache), rt)
}

fn bench_cache_key(c: &mut Criterion) {
    c.bench_function("build_cache_key", |b| {
        b.iter(|| {
            build_cache_key(
                black_box("rebac"),
                black_box("check"),
                [
                    ("user", black_box("user:123")),
                    ("relation", "viewer"),
                    ("object", "document:456"),
                ],
            )
        });
    });
}

fn bench_cached_check(c: &mut Criterion) {
    let (cache, rt) = setup_cache(CacheConfig::default());
    rt.block_on(async {
        cache
            .check("user:1", "viewer", "document:2")
            .await
            .unwrap_or_else(|_| panic!("Failed to warm cache"));
    });

    let mut group = c.benchmark_group("check");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(cache.check("user:1", "viewer", "document:2").await.ok());
            });
        });
    });

    let (disabled, rt_disabled) = setup_cache(CacheConfig::default().with_enabled(false));
    group.bench_function("disabled", |b| {
        b.iter(|| {
            rt_disabled.block_on(async {
                black_box(disabled.check("user:1", "viewer", "document:2").await.ok());
            });
        });
    });

    group.finish();
}

fn bench_batch_check(c: &mut Criterion) {
    let (cache, rt) = setup_cache(CacheConfig::default());
    let mut group = c.benchmark_group("batch_check");

    for size in &[10usize, 100, 1000] {
        // Every check appears twice
        let checks: Vec<PermissionTuple> = (0..*size)
            .map(|i| PermissionTuple::new("user:1", "viewer", format!("document:{}", i / 2)))
            .collect();
        rt.block_on(async {
            cache
                .batch_check(&checks)
                .await
                .unwrap_or_else(|_| panic!("Failed to warm cache"));
        });

        group.bench_with_input(BenchmarkId::new("dedup_keys", size), &checks, |b, checks| {
            b.iter(|| build_batch_check_keys(black_box(checks)));
        });
        group.bench_with_input(BenchmarkId::new("warm", size), &checks, |b, checks| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(cache.batch_check(checks).await.ok());
                });
            });
        });
    }

    group.finish();
}

fn bench_write_behind(c: &mut Criterion) {
    let (cache, rt) = setup_cache(CacheConfig::default());
    let config = WriteBehindConfig {
        enabled: true,
        ..WriteBehindConfig::default()
    }
    .with_batch_size(500);
    let buffer = WriteBehindCache::new(Arc::new(StaticBackend), cache, None, config)
        .unwrap_or_else(|_| panic!("Failed to create write-behind buffer"));

    let mut counter = 0u64;
    c.bench_function("write_behind_write", |b| {
        b.iter(|| {
            counter += 1;
            let object = format!("document:{counter}");
            rt.block_on(async {
                black_box(buffer.write("user:1", "editor", &object).await.ok());
            });
        });
    });
}

criterion_group!(
    benches,
    bench_cache_key,
    bench_cached_check,
    bench_batch_check,
    bench_write_behind
);
criterion_main!(benches);
