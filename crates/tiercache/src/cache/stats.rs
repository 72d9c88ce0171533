//! Cache counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::pressure::PressureSnapshot;

/// Process-lifetime counters. Monotonic; reset only by restart.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    pressure_skips: AtomicU64,
}

impl StatsRecorder {
    pub fn l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_hit("L1");
    }

    pub fn l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_hit("L2");
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_miss();
    }

    pub fn error(&self, op: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_error(op);
    }

    pub fn pressure_skip(&self) {
        self.pressure_skips.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_pressure_skip();
    }

    pub fn snapshot(
        &self,
        l1_entries: usize,
        l1_evictions: u64,
        mode: &'static str,
        pressure: Option<Arc<PressureSnapshot>>,
    ) -> CacheStats {
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            l1_hits,
            l2_hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            pressure_skips: self.pressure_skips.load(Ordering::Relaxed),
            hit_rate: hit_rate(l1_hits, l2_hits, misses),
            l1_entries,
            l1_evictions,
            mode,
            pressure: pressure.map(|p| (*p).clone()),
        }
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub pressure_skips: u64,
    /// `(l1_hits + l2_hits) / (l1_hits + l2_hits + misses)`, 0 with no traffic.
    pub hit_rate: f64,
    pub l1_entries: usize,
    /// Local entries dropped for capacity or expiry.
    pub l1_evictions: u64,
    /// `"tiered"` with a shared tier connected, `"local"` otherwise.
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<PressureSnapshot>,
}

fn hit_rate(l1_hits: u64, l2_hits: u64, misses: u64) -> f64 {
    let hits = l1_hits + l2_hits;
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
