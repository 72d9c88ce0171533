//! In-process shared tier for tests and single-node development.
//!
//! Behaves like the subset of Redis the cache uses: per-key expiry, glob
//! `SCAN MATCH` with a cursor that stays valid across deletes, and an
//! `INFO memory` equivalent whose numbers are set by the test. Faults and
//! latency can be injected to exercise degradation paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;

use super::codec;
use super::shared::{MemoryInfo, SharedTier};
use crate::error::BackendError;

struct StoredRaw {
    slot: u64,
    raw: String,
    ttl: Duration,
    expires_at: Instant,
}

impl StoredRaw {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, StoredRaw>,
    /// Slot -> key. Slots are never reused, so a cursor survives deletes.
    slots: BTreeMap<u64, String>,
    next_slot: u64,
}

impl State {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(stored) => {
                self.slots.remove(&stored.slot);
                true
            }
            None => false,
        }
    }

    fn live(&mut self, key: &str) -> Option<&StoredRaw> {
        if self.entries.get(key).is_some_and(StoredRaw::is_expired) {
            self.remove(key);
        }
        self.entries.get(key)
    }
}

#[derive(Default)]
struct Faults {
    all: Option<BackendError>,
    /// Remaining successful `delete_many` calls before failing.
    batch_deletes_left: Option<usize>,
}

pub struct MemoryTier {
    state: Mutex<State>,
    memory: Mutex<MemoryInfo>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    memory_queries: AtomicU64,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTier {
    /// Empty tier reporting no memory ceiling (pressure level 0).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_slot: 1,
                ..State::default()
            }),
            memory: Mutex::new(MemoryInfo {
                used: 0,
                max: 0,
                policy: "noeviction".into(),
            }),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            memory_queries: AtomicU64::new(0),
        }
    }

    /// Report `used` of `max` bytes from `memory_info`.
    pub fn set_memory(&self, used: u64, max: u64) {
        let mut memory = self.memory.lock();
        memory.used = used;
        memory.max = max;
    }

    /// Make memory usage land exactly on `level` (0..=10).
    pub fn set_pressure_level(&self, level: u8) {
        self.set_memory(u64::from(level.min(10)) * 100, 1000);
    }

    /// Fail every operation with `err` until [`recover`](Self::recover).
    pub fn fail_with(&self, err: BackendError) {
        self.faults.lock().all = Some(err);
    }

    /// Let `n` batch deletes succeed, then fail the rest.
    pub fn fail_batch_deletes_after(&self, n: usize) {
        self.faults.lock().batch_deletes_left = Some(n);
    }

    pub fn recover(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Delay every operation, making each call a real suspension point.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Store a raw payload, bypassing encoding.
    pub fn insert_raw(&self, key: &str, raw: &str, ttl: Duration) {
        self.store(key, raw.to_string(), ttl);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().live(key).is_some()
    }

    /// TTL the key was last written with.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.state.lock().live(key).map(|s| s.ttl)
    }

    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.entries.retain(|_, s| !s.is_expired());
        let State { entries, slots, .. } = &mut *state;
        slots.retain(|_, k| entries.contains_key(k));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_queries(&self) -> u64 {
        self.memory_queries.load(Ordering::Relaxed)
    }

    fn store(&self, key: &str, raw: String, ttl: Duration) {
        let mut state = self.state.lock();
        let expires_at = Instant::now() + ttl;
        if let Some(existing) = state.entries.get_mut(key) {
            existing.raw = raw;
            existing.ttl = ttl;
            existing.expires_at = expires_at;
            return;
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        state.slots.insert(slot, key.to_string());
        state.entries.insert(
            key.to_string(),
            StoredRaw {
                slot,
                raw,
                ttl,
                expires_at,
            },
        );
    }

    async fn enter(&self) -> Result<(), BackendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match &self.faults.lock().all {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SharedTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.enter().await?;
        let raw = self.state.lock().live(key).map(|s| s.raw.clone());
        Ok(raw.map(codec::decode))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), BackendError> {
        self.enter().await?;
        self.store(key, codec::encode(value), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.enter().await?;
        self.state.lock().remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        self.enter().await?;
        let matcher = glob_to_regex(pattern)
            .map_err(|e| BackendError::Protocol(format!("invalid pattern {pattern:?}: {e}")))?;

        let mut state = self.state.lock();
        let examined: Vec<(u64, String)> = state
            .slots
            .range(cursor..)
            .take(count.max(1))
            .map(|(slot, key)| (*slot, key.clone()))
            .collect();

        let next = match examined.last() {
            Some((last, _)) if state.slots.range(last + 1..).next().is_some() => last + 1,
            _ => 0,
        };

        let keys = examined
            .into_iter()
            .filter(|(_, key)| matcher.is_match(key))
            .filter(|(_, key)| state.live(key).is_some())
            .map(|(_, key)| key)
            .collect();

        Ok((next, keys))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError> {
        self.enter().await?;
        {
            let mut faults = self.faults.lock();
            if let Some(left) = faults.batch_deletes_left.as_mut() {
                if *left == 0 {
                    return Err(BackendError::Unavailable("injected batch delete failure".into()));
                }
                *left -= 1;
            }
        }

        let mut state = self.state.lock();
        let mut deleted = 0;
        for key in keys {
            if state.live(key).is_some() && state.remove(key) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn memory_info(&self) -> Result<MemoryInfo, BackendError> {
        self.memory_queries.fetch_add(1, Ordering::Relaxed);
        self.enter().await?;
        Ok(self.memory.lock().clone())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await
    }
}

/// Translate a Redis glob (`*`, `?`, `[...]`, `[^...]`, `\x`) to an anchored
/// regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    push_literal(&mut re, escaped);
                }
            }
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    re.push('^');
                }
                while let Some(member) = chars.next() {
                    match member {
                        ']' => break,
                        '-' => re.push('-'),
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                push_class_literal(&mut re, escaped);
                            }
                        }
                        other => push_class_literal(&mut re, other),
                    }
                }
                re.push(']');
            }
            other => push_literal(&mut re, other),
        }
    }

    re.push('$');
    Regex::new(&re)
}

fn push_literal(re: &mut String, c: char) {
    let mut buf = [0u8; 4];
    re.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn push_class_literal(re: &mut String, c: char) {
    if matches!(c, '[' | ']' | '\\' | '^' | '-' | '&' | '~') {
        re.push('\\');
    }
    re.push(c);
}
