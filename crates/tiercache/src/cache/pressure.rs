//! Shared-tier memory pressure sensing.
//!
//! ## Levels
//!
//! Memory usage is reduced to a coarse level 0–10:
//!
//! ```text
//! level = floor(min(used / max, 1.0) * 10)      (0 when max == 0)
//! ```
//!
//! ## Bands
//!
//! | Level | Band         | Effect on writes                          |
//! |-------|--------------|-------------------------------------------|
//! | 0–4   | `Normal`     | requested TTL, whole seconds, at least 1s  |
//! | 5–6   | `Reduced`    | TTL × 0.8, whole seconds, at least 1s      |
//! | 7–8   | `Capped`     | TTL capped at 60s                          |
//! | 9     | `SkipShared` | local tier only                            |
//! | 10    | `Bypass`     | nothing cached, loader called directly     |
//!
//! Sampling is rate-limited: the backend is queried at most once per refresh
//! interval, and a failed query yields a level-0 snapshot instead of an error.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::shared::{MemoryInfo, SharedTier};

/// TTL ceiling applied in the `Capped` band.
const CAPPED_TTL: Duration = Duration::from_secs(60);

/// One sample of shared-tier memory pressure. Never mutated; the next sample
/// replaces it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureSnapshot {
    pub level: u8,
    pub ratio: Option<f64>,
    /// Backend eviction policy, `"unknown"` after a failed query.
    pub policy: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sampled_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PressureSnapshot {
    pub fn from_memory(info: &MemoryInfo) -> Self {
        let (level, ratio) = if info.max == 0 {
            (0, None)
        } else {
            let used = info.used.min(info.max);
            // Integer floor avoids float rounding at band edges.
            let level = (u128::from(used) * 10 / u128::from(info.max)) as u8;
            (level.min(10), Some(info.used as f64 / info.max as f64))
        };

        Self {
            level,
            ratio,
            policy: info.policy.clone(),
            sampled_at: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    /// Safe default after a failed query: no backpressure signal.
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            level: 0,
            ratio: None,
            policy: "unknown".into(),
            sampled_at: OffsetDateTime::now_utc(),
            error: Some(error.into()),
        }
    }

    /// No shared tier connected.
    pub fn unavailable() -> Self {
        Self {
            level: 0,
            ratio: None,
            policy: "unavailable".into(),
            sampled_at: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    pub fn band(&self) -> PressureBand {
        PressureBand::from_level(self.level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureBand {
    Normal,
    Reduced,
    Capped,
    SkipShared,
    Bypass,
}

impl PressureBand {
    pub fn from_level(level: u8) -> Self {
        match level {
            0..=4 => PressureBand::Normal,
            5..=6 => PressureBand::Reduced,
            7..=8 => PressureBand::Capped,
            9 => PressureBand::SkipShared,
            _ => PressureBand::Bypass,
        }
    }

    /// TTL for a shared-tier write, or `None` when the write is skipped.
    ///
    /// Always whole seconds and at least one: the shared tier expires keys
    /// with `EX`, which has no sub-second resolution and rejects zero.
    pub fn effective_ttl(self, base: Duration) -> Option<Duration> {
        let secs = match self {
            PressureBand::Normal => base.as_secs(),
            PressureBand::Reduced => base.as_secs().saturating_mul(4) / 5,
            PressureBand::Capped => base.min(CAPPED_TTL).as_secs(),
            PressureBand::SkipShared | PressureBand::Bypass => return None,
        };
        Some(Duration::from_secs(secs.max(1)))
    }
}

/// Effective shared-tier TTL for `base` at pressure `level`.
pub fn effective_ttl(base: Duration, level: u8) -> Option<Duration> {
    PressureBand::from_level(level).effective_ttl(base)
}

struct Sampled {
    snapshot: Arc<PressureSnapshot>,
    at: Instant,
}

/// Rate-limited sampler of shared-tier memory usage.
pub struct PressureMonitor {
    refresh_interval: Duration,
    last: Mutex<Option<Sampled>>,
    /// Serializes refreshes so concurrent callers share one backend query.
    refresh: tokio::sync::Mutex<()>,
}

impl PressureMonitor {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            last: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Most recent snapshot, if any sample was taken.
    pub fn last(&self) -> Option<Arc<PressureSnapshot>> {
        self.last.lock().as_ref().map(|s| Arc::clone(&s.snapshot))
    }

    /// Current snapshot, querying `tier` only if the cached one is stale.
    pub async fn current(&self, tier: Option<&dyn SharedTier>) -> Arc<PressureSnapshot> {
        let Some(tier) = tier else {
            return self.store(PressureSnapshot::unavailable());
        };

        if let Some(fresh) = self.fresh() {
            return fresh;
        }

        let _refreshing = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(fresh) = self.fresh() {
            return fresh;
        }

        let snapshot = match tier.memory_info().await {
            Ok(info) => PressureSnapshot::from_memory(&info),
            Err(e) => {
                tracing::warn!(error = %e, "pressure sample failed, assuming no pressure");
                PressureSnapshot::unknown(e.to_string())
            }
        };

        if snapshot.level >= 7 {
            tracing::info!(
                level = snapshot.level,
                ratio = ?snapshot.ratio,
                band = ?snapshot.band(),
                "shared tier under memory pressure"
            );
        } else {
            tracing::debug!(level = snapshot.level, ratio = ?snapshot.ratio, "pressure sampled");
        }
        crate::metrics::set_pressure_level(snapshot.level);

        self.store(snapshot)
    }

    /// Drop the cached sample so the next call queries the backend.
    pub fn invalidate(&self) {
        *self.last.lock() = None;
    }

    fn fresh(&self) -> Option<Arc<PressureSnapshot>> {
        let last = self.last.lock();
        last.as_ref()
            .filter(|s| s.at.elapsed() < self.refresh_interval)
            .map(|s| Arc::clone(&s.snapshot))
    }

    fn store(&self, snapshot: PressureSnapshot) -> Arc<PressureSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.last.lock() = Some(Sampled {
            snapshot: Arc::clone(&snapshot),
            at: Instant::now(),
        });
        snapshot
    }
}
