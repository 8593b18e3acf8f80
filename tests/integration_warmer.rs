//! Integration tests for cache warming

mod common;

use common::*;
use rebac_cache::{CacheConfig, CacheEvent, CacheWarmer, ReadThroughCache, WarmingConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn warmer(config: WarmingConfig) -> (CacheWarmer, Arc<ReadThroughCache>, Arc<MockBackend>) {
    let (reads, backend, _store) = read_cache(CacheConfig::default());
    let warmer = CacheWarmer::new(backend.clone(), Arc::clone(&reads), config).unwrap();
    (warmer, reads, backend)
}

#[tokio::test]
async fn test_warm_batch_covers_cross_product_in_one_call() {
    init_tracing();
    let (warmer, reads, backend) = warmer(WarmingConfig::default());
    backend.grant("user:1", "viewer", "document:2");

    let warmed = warmer
        .warm_batch(
            &strings(&["user:1", "user:2"]),
            &strings(&["viewer", "editor"]),
            &strings(&["document:1", "document:2", "document:3"]),
        )
        .await;

    assert_eq!(warmed, 12);
    assert_eq!(backend.batch_sizes(), vec![12]);

    assert!(reads.check("user:1", "viewer", "document:2").await.unwrap());
    assert!(!reads.check("user:2", "editor", "document:3").await.unwrap());
    assert_eq!(backend.check_calls(), 0);
}

#[tokio::test]
async fn test_warm_batch_is_chunked() {
    let config = WarmingConfig {
        chunk_size: 5,
        ..WarmingConfig::default()
    };
    let (warmer, _reads, backend) = warmer(config);

    let warmed = warmer
        .warm_batch(
            &strings(&["user:1", "user:2"]),
            &strings(&["viewer", "editor"]),
            &strings(&["document:1", "document:2", "document:3"]),
        )
        .await;

    assert_eq!(warmed, 12);
    assert_eq!(backend.batch_sizes(), vec![5, 5, 2]);
}

#[tokio::test]
async fn test_warm_batch_failure_counts_nothing() {
    let (warmer, _reads, backend) = warmer(WarmingConfig::default());
    backend.set_failing(true);

    let warmed = warmer
        .warm_batch(
            &strings(&["user:1"]),
            &strings(&["viewer"]),
            &strings(&["document:1"]),
        )
        .await;
    assert_eq!(warmed, 0);
}

#[tokio::test]
async fn test_warm_for_user_emits_event() {
    let (warmer, _reads, _backend) = warmer(WarmingConfig::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    warmer
        .observers()
        .subscribe(Arc::new(move |event: &CacheEvent| sink.lock().push(event.clone())));

    let warmed = warmer
        .warm_for_user(
            "user:1",
            &strings(&["viewer", "editor"]),
            &strings(&["document:1", "document:2"]),
        )
        .await;

    assert_eq!(warmed, 4);
    assert_eq!(
        events.lock().clone(),
        vec![CacheEvent::CacheWarmed {
            identifier: "user:1".to_string(),
            entries_warmed: 4,
        }]
    );
}

/// Owner granted: one check answers the whole hierarchy
#[tokio::test]
async fn test_warm_hierarchy_stops_at_first_grant() {
    let (warmer, reads, backend) = warmer(WarmingConfig::default());
    backend.grant("user:1", "owner", "document:1");

    let warmed = warmer
        .warm_hierarchy(
            "user:1",
            "document:1",
            &strings(&["viewer", "editor", "owner"]),
        )
        .await;

    assert_eq!(warmed, 3);
    assert_eq!(backend.check_calls(), 1);

    assert!(reads.check("user:1", "viewer", "document:1").await.unwrap());
    assert!(reads.check("user:1", "editor", "document:1").await.unwrap());
    assert_eq!(backend.check_calls(), 1);
}

#[tokio::test]
async fn test_warm_hierarchy_checks_everything_without_grant() {
    let (warmer, reads, backend) = warmer(WarmingConfig::default());

    let warmed = warmer
        .warm_hierarchy(
            "user:1",
            "document:1",
            &strings(&["viewer", "editor", "owner"]),
        )
        .await;

    assert_eq!(warmed, 3);
    assert_eq!(backend.check_calls(), 3);
    assert!(!reads.check("user:1", "viewer", "document:1").await.unwrap());
    assert_eq!(backend.check_calls(), 3);
}

#[tokio::test]
async fn test_warm_hierarchy_without_inference_checks_every_relation() {
    let config = WarmingConfig {
        infer_hierarchy: false,
        ..WarmingConfig::default()
    };
    let (warmer, reads, backend) = warmer(config);
    backend.grant("user:1", "editor", "document:1");

    let warmed = warmer
        .warm_hierarchy(
            "user:1",
            "document:1",
            &strings(&["viewer", "editor", "owner"]),
        )
        .await;

    assert_eq!(warmed, 3);
    assert_eq!(backend.check_calls(), 3);
    // Not inferred: the real answer was cached
    assert!(!reads.check("user:1", "viewer", "document:1").await.unwrap());
}

#[tokio::test]
async fn test_warm_related_warms_found_objects() {
    let (warmer, _reads, backend) = warmer(WarmingConfig::default());
    backend.set_objects("viewer", "document", &["document:1", "document:2"]);
    backend.set_objects("editor", "document", &["document:3"]);

    let warmed = warmer
        .warm_related("user:1", "document:7", &strings(&["viewer", "editor"]))
        .await;

    // viewer: 2 objects × 2 relations, editor: 1 object × 2 relations
    assert_eq!(warmed, 6);
    assert_eq!(backend.list_calls(), 2);
}

#[tokio::test]
async fn test_warm_from_activity_without_source_is_zero() {
    let (warmer, _reads, backend) = warmer(WarmingConfig::default());

    assert_eq!(warmer.warm_from_activity(Duration::from_secs(3600)).await, 0);
    assert_eq!(backend.batch_calls(), 0);
}

#[tokio::test]
async fn test_warm_from_activity_groups_by_user() {
    let (warmer, reads, backend) = warmer(WarmingConfig::default());
    let warmer = warmer.with_activity_source(StaticActivity::new(&[
        ("user:1", "document:1"),
        ("user:1", "document:2"),
        ("user:2", "document:1"),
        ("user:1", "document:1"),
    ]));

    let warmed = warmer.warm_from_activity(Duration::from_secs(3600)).await;

    // viewer, editor, owner × (2 objects for user:1 + 1 for user:2)
    assert_eq!(warmed, 9);
    assert_eq!(backend.batch_sizes(), vec![6, 3]);
    assert!(!reads.check("user:2", "owner", "document:1").await.unwrap());
    assert_eq!(backend.check_calls(), 0);
}

#[tokio::test]
async fn test_disabled_cache_warms_nothing() {
    let (reads, backend, store) = read_cache(CacheConfig::default().with_enabled(false));
    let warmer = CacheWarmer::new(backend.clone(), reads, WarmingConfig::default()).unwrap();

    let relations = strings(&["viewer", "editor", "owner"]);
    assert_eq!(
        warmer
            .warm_batch(&strings(&["user:1"]), &relations, &strings(&["document:1"]))
            .await,
        0
    );
    assert_eq!(warmer.warm_hierarchy("user:1", "document:1", &relations).await, 0);
    assert_eq!(warmer.warm_related("user:1", "document:1", &relations).await, 0);
    assert_eq!(warmer.invalidate("user:1", "viewer", None).await.unwrap(), 0);

    assert_eq!(backend.batch_calls() + backend.check_calls() + backend.list_calls(), 0);
    assert_eq!(store.interactions(), 0);
}

#[tokio::test]
async fn test_invalidate_by_pattern() {
    let (warmer, reads, backend) = warmer(WarmingConfig::default());
    warmer
        .warm_batch(
            &strings(&["user:1"]),
            &strings(&["viewer", "editor"]),
            &strings(&["document:1", "document:2", "folder:1"]),
        )
        .await;

    assert_eq!(
        warmer
            .invalidate("user:1", "viewer", Some("document:*"))
            .await
            .unwrap(),
        2
    );
    assert_eq!(warmer.invalidate("user:1", "editor", None).await.unwrap(), 3);

    // viewer on folder:1 survived
    reads.check("user:1", "viewer", "folder:1").await.unwrap();
    assert_eq!(backend.check_calls(), 0);
    reads.check("user:1", "viewer", "document:1").await.unwrap();
    assert_eq!(backend.check_calls(), 1);
}

#[tokio::test]
async fn test_invalidate_matches_identifiers_literally() {
    let (warmer, reads, backend) = warmer(WarmingConfig::default());
    reads.prime("user:*", "viewer", "document:1", true).await.unwrap();
    reads.prime("user:1", "viewer", "document:1", true).await.unwrap();
    reads.prime("user:1", "viewer", "document:2", false).await.unwrap();

    assert_eq!(warmer.invalidate("user:*", "viewer", None).await.unwrap(), 1);

    // user:1 entries are still cached
    assert!(reads.check("user:1", "viewer", "document:1").await.unwrap());
    assert!(!reads.check("user:1", "viewer", "document:2").await.unwrap());
    assert_eq!(backend.check_calls(), 0);
}

#[tokio::test]
async fn test_invalidate_accepts_bracket_and_brace_identifiers() {
    let (warmer, reads, _backend) = warmer(WarmingConfig::default());
    reads.prime("user:[x", "viewer", "document:1", true).await.unwrap();
    reads.prime("group:{a,b}", "member", "team:1", true).await.unwrap();
    reads.prime("group:a", "member", "team:1", true).await.unwrap();

    assert_eq!(warmer.invalidate("user:[x", "viewer", None).await.unwrap(), 1);
    assert_eq!(
        warmer
            .invalidate("group:{a,b}", "member", Some("team:*"))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_invalidate_without_pattern_support_returns_zero() {
    let backend = MockBackend::new();
    let store = RecordingStore::plain();
    let reads = Arc::new(
        ReadThroughCache::new(backend.clone(), store, CacheConfig::default()).unwrap(),
    );
    let warmer = CacheWarmer::new(backend, reads, WarmingConfig::default()).unwrap();

    assert_eq!(warmer.invalidate("user:1", "viewer", None).await.unwrap(), 0);
}
