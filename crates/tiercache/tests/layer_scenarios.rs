//! End-to-end behavior of the cache layer over an in-memory shared tier.
//!
//! Pressure levels are forced through `MemoryTier::set_pressure_level`; the
//! refresh interval is zero so every decision sees the latest level.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tiercache::cache::keys;
use tiercache::{BackendError, CacheLayer, CacheSettings, MemoryTier, SharedTier};

fn settings() -> CacheSettings {
    let mut settings = CacheSettings::default();
    settings.redis.enabled = false;
    settings.cache.pressure_refresh_secs = 0;
    settings
}

async fn setup() -> (Arc<MemoryTier>, CacheLayer) {
    let tier = Arc::new(MemoryTier::new());
    let layer = CacheLayer::with_shared_tier(settings(), Arc::clone(&tier) as Arc<dyn SharedTier>)
        .expect("layer");
    layer.init().await.expect("init");
    (tier, layer)
}

fn shared_key(layer: &CacheLayer, raw: &str) -> String {
    layer.keys().shared(raw)
}

async fn fail_if_called() -> anyhow::Result<Option<Value>> {
    panic!("loader must not be called");
}

#[tokio::test]
async fn set_then_get_hits_l1() {
    let (_tier, layer) = setup().await;

    layer
        .set("task:1", &json!({"id": 1}), Some(Duration::from_secs(120)))
        .await
        .unwrap();

    let value = layer.get_with("task:1", fail_if_called, None).await.unwrap();
    assert_eq!(value, Some(json!({"id": 1})));

    let stats = layer.get_stats();
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn fresh_process_reads_through_l2_and_repopulates_l1() {
    let (tier, layer) = setup().await;
    layer
        .set("task:1", &json!({"id": 1}), Some(Duration::from_secs(120)))
        .await
        .unwrap();
    assert_eq!(
        tier.ttl_of(&shared_key(&layer, "task:1")),
        Some(Duration::from_secs(120))
    );

    layer.local_tier().clear();

    let value = layer.get_with("task:1", fail_if_called, None).await.unwrap();
    assert_eq!(value, Some(json!({"id": 1})));
    assert_eq!(layer.get_stats().l2_hits, 1);
    assert_eq!(layer.local_tier().size(), 1);

    // Second read is served locally.
    layer.get("task:1").await.unwrap();
    assert_eq!(layer.get_stats().l1_hits, 1);
}

#[tokio::test]
async fn miss_loads_and_fills_both_tiers_with_default_ttl() {
    let (tier, layer) = setup().await;
    tier.set_pressure_level(3);
    let key = keys::task(9);

    let value = layer
        .get_with(&key, || async { Ok(Some(json!({"id": 9}))) }, None)
        .await
        .unwrap();
    assert_eq!(value, Some(json!({"id": 9})));

    let stored = shared_key(&layer, &key);
    assert!(tier.contains(&stored));
    assert_eq!(tier.ttl_of(&stored), Some(Duration::from_secs(300)));

    layer.get_with(&key, fail_if_called, None).await.unwrap();
    let stats = layer.get_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.l1_hits, 1);
    assert_eq!(stats.pressure.as_ref().map(|p| p.level), Some(3));
}

#[tokio::test]
async fn get_without_loader_counts_miss() {
    let (_tier, layer) = setup().await;
    assert_eq!(layer.get("nope").await, None);
    assert_eq!(layer.get_stats().misses, 1);
}

#[tokio::test]
async fn absent_loader_result_is_not_cached() {
    let (tier, layer) = setup().await;
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let value = layer
            .get_with(
                "task:404",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None::<Value>)
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(tier.is_empty());
    assert_eq!(layer.local_tier().size(), 0);
}

#[tokio::test]
async fn level_nine_set_skips_shared_write() {
    let (tier, layer) = setup().await;
    tier.set_pressure_level(9);

    layer.set("k", &json!("v"), None).await.unwrap();

    assert_eq!(layer.local_tier().size(), 1);
    assert!(!tier.contains(&shared_key(&layer, "k")));
    assert_eq!(layer.get_stats().pressure_skips, 1);
}

#[tokio::test]
async fn level_nine_load_fills_local_only() {
    let (tier, layer) = setup().await;
    tier.set_pressure_level(9);
    let key = keys::task(3);

    let value = layer
        .get_with(&key, || async { Ok(Some(json!({"id": 3}))) }, None)
        .await
        .unwrap();
    assert_eq!(value, Some(json!({"id": 3})));

    assert_eq!(layer.local_tier().size(), 1);
    assert!(!tier.contains(&shared_key(&layer, &key)));
    let stats = layer.get_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.pressure_skips, 1);

    // Served locally from now on.
    layer.get_with(&key, fail_if_called, None).await.unwrap();
    assert_eq!(layer.get_stats().l1_hits, 1);
}

#[tokio::test]
async fn level_ten_bypasses_caching() {
    let (tier, layer) = setup().await;
    tier.set_pressure_level(10);
    let calls = AtomicUsize::new(0);

    let value = layer
        .get_with(
            "k",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(json!("fresh")))
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(value, Some(json!("fresh")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tier.is_empty());
    assert_eq!(layer.local_tier().size(), 0);
    assert_eq!(layer.get_stats().pressure_skips, 1);
}

#[tokio::test]
async fn ttl_adapts_to_pressure_band() {
    let (tier, layer) = setup().await;
    let base = Some(Duration::from_secs(300));

    let cases = [(2, 300), (5, 240), (6, 240), (7, 60), (8, 60)];
    for (level, expected) in cases {
        tier.set_pressure_level(level);
        let key = format!("ttl:{level}");
        layer.set(&key, &json!(level), base).await.unwrap();
        assert_eq!(
            tier.ttl_of(&shared_key(&layer, &key)),
            Some(Duration::from_secs(expected)),
            "level {level}"
        );
    }
    assert_eq!(layer.get_stats().pressure_skips, 0);
}

#[tokio::test]
async fn sub_second_ttls_round_up_to_one_second() {
    let (tier, layer) = setup().await;

    layer
        .set("half", &json!(1), Some(Duration::from_millis(500)))
        .await
        .unwrap();
    layer.set("zero", &json!(2), Some(Duration::ZERO)).await.unwrap();

    assert_eq!(
        tier.ttl_of(&shared_key(&layer, "half")),
        Some(Duration::from_secs(1))
    );
    assert!(tier.contains(&shared_key(&layer, "zero")));
    assert_eq!(
        tier.ttl_of(&shared_key(&layer, "zero")),
        Some(Duration::from_secs(1))
    );
}

#[tokio::test]
async fn delete_removes_both_tiers_at_every_level() {
    let (tier, layer) = setup().await;

    for level in 0..=10u8 {
        tier.set_pressure_level(0);
        layer.set("k", &json!(level), None).await.unwrap();
        assert!(tier.contains(&shared_key(&layer, "k")));

        tier.set_pressure_level(level);
        layer.delete("k").await;

        assert!(!tier.contains(&shared_key(&layer, "k")), "level {level}");
        assert_eq!(layer.local_tier().size(), 0, "level {level}");
    }
}

#[tokio::test]
async fn delete_pattern_removes_matching_shared_keys() {
    let (tier, layer) = setup().await;
    for id in 0..12 {
        layer.set(&keys::task(id), &json!({"id": id}), None).await.unwrap();
    }
    layer.set("user:1", &json!({"id": 1}), None).await.unwrap();

    let deleted = layer.delete_pattern(keys::task_pattern()).await;

    assert_eq!(deleted, 12);
    assert_eq!(tier.len(), 1);
    assert!(tier.contains(&shared_key(&layer, "user:1")));
    // Local tier is left to expire on its own.
    assert_eq!(layer.local_tier().size(), 13);
}

#[tokio::test]
async fn delete_pattern_reports_partial_count_on_failure() {
    let mut small_batches = settings();
    small_batches.cache.scan_batch_size = 5;
    let tier = Arc::new(MemoryTier::new());
    let layer =
        CacheLayer::with_shared_tier(small_batches, Arc::clone(&tier) as Arc<dyn SharedTier>)
            .unwrap();

    for id in 0..20 {
        layer.set(&keys::task(id), &json!(id), None).await.unwrap();
    }
    tier.fail_batch_deletes_after(2);

    let deleted = layer.delete_pattern("task:*").await;

    assert_eq!(deleted, 10);
    assert_eq!(tier.len(), 10);
    assert_eq!(layer.get_stats().errors, 1);
}

#[tokio::test]
async fn backend_failures_are_absorbed() {
    let (tier, layer) = setup().await;
    tier.fail_with(BackendError::Timeout("slow".into()));

    layer.set("k", &json!(1), None).await.unwrap();
    layer.delete("k").await;
    assert_eq!(layer.delete_pattern("*").await, 0);

    let value = layer
        .get_with("k2", || async { Ok(Some(json!(2))) }, None)
        .await
        .unwrap();
    assert_eq!(value, Some(json!(2)));

    let stats = layer.get_stats();
    // set, delete, delete_pattern, get (x2 lookups), write-back
    assert_eq!(stats.errors, 6);
    let pressure = stats.pressure.expect("pressure sampled");
    assert_eq!(pressure.policy, "unknown");
    assert_eq!(pressure.level, 0);
}

#[tokio::test]
async fn undecodable_shared_payload_is_returned_raw() {
    let (tier, layer) = setup().await;
    tier.insert_raw(&shared_key(&layer, "legacy"), "plain text", Duration::from_secs(60));

    assert_eq!(layer.get("legacy").await, Some(json!("plain text")));
}

#[tokio::test]
async fn invalidate_after_runs_mutation_then_deletes() {
    let (tier, layer) = setup().await;
    let key = keys::task(5);
    layer.set(&key, &json!({"done": false}), None).await.unwrap();

    let updated = layer
        .invalidate_after(&key, async { json!({"done": true}) })
        .await;

    assert_eq!(updated, json!({"done": true}));
    assert!(!tier.contains(&shared_key(&layer, &key)));
    assert_eq!(layer.get(&key).await, None);
}

#[tokio::test]
async fn hit_rate() {
    let (_tier, layer) = setup().await;
    assert_eq!(layer.get_stats().hit_rate, 0.0);

    layer.set("a", &json!(1), None).await.unwrap();
    layer.get("a").await;
    layer.get("a").await;
    layer.get("b").await;

    let stats = layer.get_stats();
    let expected = (stats.l1_hits + stats.l2_hits) as f64
        / (stats.l1_hits + stats.l2_hits + stats.misses) as f64;
    assert!((stats.hit_rate - expected).abs() < 1e-9);
    assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.mode, "tiered");
}

#[tokio::test]
async fn local_evictions_are_reported() {
    let mut small = settings();
    small.cache.local_max_entries = 2;
    let layer = CacheLayer::new(small).unwrap();

    for key in ["a", "b", "c"] {
        layer.set(key, &json!(key), None).await.unwrap();
    }

    let stats = layer.get_stats();
    assert_eq!(stats.l1_entries, 2);
    assert_eq!(stats.l1_evictions, 1);
}
