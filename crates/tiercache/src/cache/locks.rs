//! Per-key locks for stampede protection.
//!
//! When several tasks miss the same key at once, they all take the same
//! `tokio::sync::Mutex`, so only the first runs the loader and the rest find
//! the value on their post-lock re-check.
//!
//! The registry is a bounded `moka` cache with an idle TTL, so locks for keys
//! nobody touches any more are reclaimed. Both bounds must comfortably exceed
//! the slowest loader: a lock reclaimed while still held would let a newcomer
//! create a second lock for the same key.
//!
//! Eviction is plain LRU. moka's default TinyLFU may refuse to admit a new
//! key into a full registry of frequently used ones, which would hand every
//! caller of a cold key its own mutex.
//!
//! Locks are process-local. Workers sharing one Redis still each run their
//! own loader on a cold key.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tokio::sync::Mutex;

pub type KeyLock = Arc<Mutex<()>>;

pub struct LockRegistry {
    locks: Cache<String, KeyLock>,
}

impl LockRegistry {
    pub fn new(max_entries: u64, idle: Duration) -> Self {
        Self {
            locks: Cache::builder()
                .max_capacity(max_entries)
                .time_to_idle(idle)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    /// The lock for `key`, created on first request. Concurrent callers for
    /// the same key always receive the same instance.
    pub async fn acquire_for(&self, key: &str) -> KeyLock {
        self.locks
            .get_with_by_ref(key, async { Arc::new(Mutex::new(())) })
            .await
    }

    /// Number of locks currently tracked (approximate until pending
    /// maintenance runs).
    pub fn len(&self) -> u64 {
        self.locks.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending evictions. Mostly useful for tests.
    pub async fn run_pending_tasks(&self) {
        self.locks.run_pending_tasks().await;
    }
}
