//! Local (L1) tier: bounded, TTL-expiring in-process store.
//!
//! Entries live in a `DashMap`; insertion order is tracked separately so that
//! capacity overflow can evict the least-recently-inserted entry. Order
//! records are tagged with a sequence number, so records left behind by
//! deletes or re-inserts are recognized as stale and skipped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

struct CachedEntry {
    value: Value,
    inserted_at: Instant,
    seq: u64,
}

pub struct LocalTier {
    entries: DashMap<String, CachedEntry>,
    /// (key, seq) in insertion order. Lock order: `order` before `entries`.
    order: Mutex<VecDeque<(String, u64)>>,
    next_seq: AtomicU64,
    max_entries: usize,
    ttl: Duration,
    evictions: AtomicU64,
}

impl LocalTier {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            max_entries: max_entries.max(1),
            ttl,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            return Some(entry.value.clone());
        }
        let seq = entry.seq;
        drop(entry);
        if self.entries.remove_if(key, |_, e| e.seq == seq).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn set(&self, key: &str, value: Value) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut order = self.order.lock();

        self.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
        order.push_back((key.to_string(), seq));

        while self.entries.len() > self.max_entries {
            let Some((oldest, oldest_seq)) = order.pop_front() else {
                break;
            };
            if self
                .entries
                .remove_if(&oldest, |_, e| e.seq == oldest_seq)
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %oldest, "L1 capacity eviction");
            }
        }

        // Re-inserts and deletes leave stale records behind.
        if order.len() > self.max_entries.saturating_mul(2) {
            order.retain(|(k, s)| self.entries.get(k).is_some_and(|e| e.seq == *s));
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Remove expired entries. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.inserted_at.elapsed() >= self.ttl {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Start the background sweep. Abort the returned handle to stop it.
    pub fn start_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // First tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;

                let removed = self.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, "L1 sweep removed expired entries");
                }
                crate::metrics::set_cache_entries("L1", self.size());
            }
        })
    }
}
