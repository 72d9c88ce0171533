//! The cache façade: read-through, write-through and invalidation across
//! both tiers.
//!
//! ## Read protocol (`get_with`)
//!
//! ```text
//! L1 lookup ──hit──▶ return
//!    │ miss
//! L2 lookup ──hit──▶ fill L1, return
//!    │ miss
//! pressure == 10 ──▶ call loader, return uncached
//!    │
//! per-key lock ─▶ re-check L1, L2 ─hit─▶ return
//!    │ miss
//! loader ─▶ write L1 (+ L2 unless pressure >= 9) ─▶ return
//! ```
//!
//! Shared-tier failures are logged and counted, never returned: the cache
//! is an optimization, not the system of record.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::codec;
use super::keys::CacheKeys;
use super::local::LocalTier;
use super::locks::LockRegistry;
use super::pressure::{PressureBand, PressureMonitor, PressureSnapshot};
use super::redis::RedisTier;
use super::shared::SharedTier;
use super::stats::{CacheStats, StatsRecorder};
use crate::config::CacheSettings;
use crate::error::CacheError;

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    sweeper: Option<JoinHandle<()>>,
    /// Client supplied by the embedder; re-attached on every `init`.
    injected: Option<Arc<dyn SharedTier>>,
}

/// Two-tier cache with stampede protection and pressure-aware writes.
///
/// Construct once at startup, share as `Arc<CacheLayer>`, call
/// [`init`](Self::init) before serving and [`close`](Self::close) on
/// shutdown. Until `init` connects a shared tier, the layer works
/// local-only.
pub struct CacheLayer {
    settings: CacheSettings,
    keys: CacheKeys,
    local: Arc<LocalTier>,
    shared: RwLock<Option<Arc<dyn SharedTier>>>,
    locks: LockRegistry,
    pressure: PressureMonitor,
    stats: StatsRecorder,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl CacheLayer {
    /// Build a layer whose shared tier is Redis, connected by `init`.
    pub fn new(settings: CacheSettings) -> Result<Self, CacheError> {
        Self::build(settings, None)
    }

    /// Build a layer over a caller-supplied shared tier. The tier is usable
    /// immediately; `init` verifies it and starts background maintenance.
    pub fn with_shared_tier(
        settings: CacheSettings,
        tier: Arc<dyn SharedTier>,
    ) -> Result<Self, CacheError> {
        Self::build(settings, Some(tier))
    }

    fn build(
        settings: CacheSettings,
        injected: Option<Arc<dyn SharedTier>>,
    ) -> Result<Self, CacheError> {
        settings.validate().map_err(CacheError::Config)?;

        let cache = &settings.cache;
        Ok(Self {
            keys: CacheKeys::new(cache.namespace.clone()),
            local: Arc::new(LocalTier::new(cache.local_max_entries, cache.local_ttl())),
            shared: RwLock::new(injected.clone()),
            locks: LockRegistry::new(cache.lock_max_entries, cache.lock_idle()),
            pressure: PressureMonitor::new(cache.pressure_refresh()),
            stats: StatsRecorder::default(),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                injected,
                ..Lifecycle::default()
            }),
            settings,
        })
    }

    /// Connect the shared tier and start the L1 sweeper. Safe to call
    /// repeatedly; only the first call after construction (or after
    /// [`close`](Self::close)) does any work.
    ///
    /// An invalid Redis URL is fatal. An unreachable Redis is not: the layer
    /// stays in local-only mode.
    pub async fn init(&self) -> Result<(), CacheError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.initialized {
            return Ok(());
        }

        let candidate: Option<Arc<dyn SharedTier>> = match &lifecycle.injected {
            Some(tier) => Some(Arc::clone(tier)),
            None if self.settings.redis.enabled => {
                tracing::info!(url = %self.settings.redis.url, "Connecting to Redis");
                Some(Arc::new(RedisTier::new(&self.settings.redis)?))
            }
            None => {
                tracing::info!("Redis disabled, using local cache only");
                None
            }
        };

        let connected = match candidate {
            Some(tier) => match tier.ping().await {
                Ok(()) => {
                    tracing::info!("Shared cache tier connected");
                    Some(tier)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Shared cache tier unreachable. Falling back to local cache."
                    );
                    None
                }
            },
            None => None,
        };
        *self.shared.write() = connected;
        self.pressure.invalidate();

        lifecycle.sweeper = Some(
            Arc::clone(&self.local).start_sweeper(self.settings.cache.sweep_interval()),
        );
        lifecycle.initialized = true;
        Ok(())
    }

    /// Release the shared-tier connection and stop the sweeper. Idempotent.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(sweeper) = lifecycle.sweeper.take() {
            sweeper.abort();
        }
        if self.shared.write().take().is_some() {
            tracing::info!("Shared cache tier released");
        }
        lifecycle.initialized = false;
    }

    /// Look up `key` in both tiers without loading. A miss is counted.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let found = self.lookup(key).await;
        if found.is_none() {
            self.stats.miss();
            tracing::debug!(key = %key, "cache miss");
        }
        found
    }

    /// Read-through lookup. On a miss, `loader` runs at most once per key
    /// across concurrent callers (below pressure level 10) and its result is
    /// cached. `ttl` overrides the default shared-tier TTL; the local tier
    /// always uses its own configured TTL.
    ///
    /// `Ok(None)` from the loader is returned as-is and never cached.
    pub async fn get_with<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<Value>, CacheError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(Some(value));
        }

        let pressure = self.current_pressure().await;
        if pressure.band() == PressureBand::Bypass {
            self.stats.pressure_skip();
            tracing::debug!(key = %key, level = pressure.level, "pressure bypass, loading uncached");
            let loaded = loader().await.map_err(CacheError::Loader)?;
            return Ok(loaded.map(|v| codec::to_value(&v)).transpose()?);
        }

        self.load_locked(key, loader, ttl).await
    }

    /// Write a value to both tiers. Only a serialization failure is
    /// returned; shared-tier trouble is absorbed.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let value = codec::to_value(value)?;
        self.write_through(key, &value, ttl).await;
        Ok(())
    }

    /// Remove `key` from both tiers, whatever the pressure level.
    pub async fn delete(&self, key: &str) {
        self.local.delete(&self.keys.local(key));

        let Some(tier) = self.shared() else {
            return;
        };
        match tier.delete(&self.keys.shared(key)).await {
            Ok(()) => tracing::debug!(key = %key, "cache invalidated (L1+L2)"),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "shared tier DEL failed");
                self.stats.error("delete");
            }
        }
    }

    /// Delete every shared-tier key matching the glob `pattern` (applied to
    /// raw keys). The local tier is left to expire on its own.
    ///
    /// Returns the number of keys deleted, which is partial if the scan was
    /// interrupted.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let Some(tier) = self.shared() else {
            return 0;
        };

        let scan_pattern = self.keys.shared_pattern(pattern);
        match tier
            .scan_delete(&scan_pattern, self.settings.cache.scan_batch_size)
            .await
        {
            Ok(deleted) => {
                tracing::info!(pattern = %pattern, deleted, "pattern invalidated");
                deleted
            }
            Err(e) => {
                tracing::warn!(
                    pattern = %pattern,
                    deleted = e.deleted,
                    error = %e.source,
                    "pattern delete interrupted"
                );
                self.stats.error("delete_pattern");
                e.deleted
            }
        }
    }

    /// Run a mutation, then invalidate `key` so the next read reloads it.
    pub async fn invalidate_after<T, Fut>(&self, key: &str, mutation: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let output = mutation.await;
        self.delete(key).await;
        output
    }

    pub fn get_stats(&self) -> CacheStats {
        let mode = if self.has_shared_tier() {
            "tiered"
        } else {
            "local"
        };
        self.stats.snapshot(
            self.local.size(),
            self.local.evictions(),
            mode,
            self.pressure.last(),
        )
    }

    /// Current pressure snapshot (sampled at most once per refresh interval).
    pub async fn current_pressure(&self) -> Arc<PressureSnapshot> {
        let tier = self.shared();
        self.pressure.current(tier.as_deref()).await
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.read().is_some()
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// The local tier (for testing/internal use).
    pub fn local_tier(&self) -> &LocalTier {
        &self.local
    }

    fn shared(&self) -> Option<Arc<dyn SharedTier>> {
        self.shared.read().clone()
    }

    /// Non-suspending L1 check.
    fn lookup_local(&self, key: &str) -> Option<Value> {
        self.local.get(&self.keys.local(key))
    }

    /// L2 check; a hit is promoted to L1. Failures count as misses.
    async fn lookup_shared(&self, key: &str) -> Option<Value> {
        let tier = self.shared()?;
        match tier.get(&self.keys.shared(key)).await {
            Ok(Some(value)) => {
                self.local.set(&self.keys.local(key), value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, kind = e.kind(), "shared tier GET failed");
                self.stats.error("get");
                None
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.lookup_local(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            self.stats.l1_hit();
            return Some(value);
        }
        if let Some(value) = self.lookup_shared(key).await {
            tracing::debug!(key = %key, "cache hit (L2)");
            self.stats.l2_hit();
            return Some(value);
        }
        None
    }

    /// Critical section: one loader per key at a time.
    async fn load_locked<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Option<Duration>,
    ) -> Result<Option<Value>, CacheError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let lock = self.locks.acquire_for(key).await;
        let _guard = lock.lock().await;

        // Filled by whoever held the lock before us.
        if let Some(value) = self.lookup(key).await {
            return Ok(Some(value));
        }

        self.stats.miss();
        tracing::debug!(key = %key, "cache miss, invoking loader");

        let Some(loaded) = loader().await.map_err(CacheError::Loader)? else {
            return Ok(None);
        };
        let value = codec::to_value(&loaded)?;
        self.write_through(key, &value, ttl).await;
        Ok(Some(value))
    }

    async fn write_through(&self, key: &str, value: &Value, ttl: Option<Duration>) {
        self.local.set(&self.keys.local(key), value.clone());

        let Some(tier) = self.shared() else {
            return;
        };

        let base = ttl.unwrap_or_else(|| self.settings.cache.shared_ttl());
        let pressure = self.pressure.current(Some(tier.as_ref())).await;

        match pressure.band().effective_ttl(base) {
            Some(effective) => {
                if let Err(e) = tier.set(&self.keys.shared(key), value, effective).await {
                    tracing::warn!(key = %key, error = %e, kind = e.kind(), "shared tier SET failed");
                    self.stats.error("set");
                } else {
                    tracing::debug!(
                        key = %key,
                        ttl_secs = effective.as_secs(),
                        level = pressure.level,
                        "cache set (L1+L2)"
                    );
                }
            }
            None => {
                self.stats.pressure_skip();
                tracing::debug!(key = %key, level = pressure.level, "cache set (L1 only, pressure)");
            }
        }
    }
}

impl Drop for CacheLayer {
    fn drop(&mut self) {
        if let Some(sweeper) = self.lifecycle.get_mut().sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryTier;
    use crate::error::BackendError;
    use serde_json::json;

    fn settings() -> CacheSettings {
        let mut settings = CacheSettings::default();
        settings.redis.enabled = false;
        settings.cache.pressure_refresh_secs = 0;
        settings
    }

    fn layer_with(tier: &Arc<MemoryTier>) -> CacheLayer {
        CacheLayer::with_shared_tier(settings(), Arc::clone(tier) as Arc<dyn SharedTier>)
            .expect("layer")
    }

    #[tokio::test]
    async fn lookup_phases_are_independent() {
        let tier = Arc::new(MemoryTier::new());
        let layer = layer_with(&tier);

        tier.set("appcache:l2:k", &json!("remote"), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(layer.lookup_local("k"), None);
        assert_eq!(layer.lookup_shared("k").await, Some(json!("remote")));
        // Promotion happened as part of the shared phase.
        assert_eq!(layer.lookup_local("k"), Some(json!("remote")));
    }

    #[tokio::test]
    async fn local_only_without_shared_tier() {
        let layer = CacheLayer::new(settings()).unwrap();
        layer.init().await.unwrap();
        assert!(!layer.has_shared_tier());

        layer.set("k", &json!(1), None).await.unwrap();
        assert_eq!(layer.get("k").await, Some(json!(1)));
        assert_eq!(layer.delete_pattern("*").await, 0);
        assert_eq!(layer.get_stats().mode, "local");
        layer.close().await;
    }

    #[tokio::test]
    async fn invalid_settings_are_fatal() {
        let mut bad = settings();
        bad.cache.local_max_entries = 0;
        assert!(matches!(CacheLayer::new(bad), Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn invalid_redis_url_is_fatal_at_init() {
        let mut bad = settings();
        bad.redis.enabled = true;
        bad.redis.url = "definitely not a url".into();
        let layer = CacheLayer::new(bad).unwrap();
        assert!(matches!(layer.init().await, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_shared_tier_degrades_at_init() {
        let tier = Arc::new(MemoryTier::new());
        tier.fail_with(BackendError::Unavailable("refused".into()));
        let layer = layer_with(&tier);

        layer.init().await.unwrap();
        assert!(!layer.has_shared_tier());

        layer.set("k", &json!("v"), None).await.unwrap();
        assert_eq!(layer.get("k").await, Some(json!("v")));
        assert_eq!(layer.get_stats().errors, 0);
    }

    #[tokio::test]
    async fn init_and_close_are_idempotent() {
        let tier = Arc::new(MemoryTier::new());
        let layer = layer_with(&tier);

        layer.init().await.unwrap();
        layer.init().await.unwrap();
        assert!(layer.has_shared_tier());

        layer.close().await;
        layer.close().await;
        assert!(!layer.has_shared_tier());

        // Re-init re-attaches the injected tier.
        layer.init().await.unwrap();
        assert!(layer.has_shared_tier());
    }

    #[tokio::test]
    async fn serialization_error_is_surfaced() {
        use std::collections::HashMap;

        let tier = Arc::new(MemoryTier::new());
        let layer = layer_with(&tier);
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 1), 1);

        let err = layer.set("k", &bad, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(layer.get("k").await.is_none());
    }

    #[tokio::test]
    async fn loader_error_propagates_and_releases_lock() {
        let tier = Arc::new(MemoryTier::new());
        let layer = layer_with(&tier);

        let err = layer
            .get_with("k", || async { Err::<Option<i32>, _>(anyhow::anyhow!("db down")) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Loader(_)));

        let value = layer
            .get_with("k", || async { Ok(Some(5)) }, None)
            .await
            .unwrap();
        assert_eq!(value, Some(json!(5)));
    }
}
