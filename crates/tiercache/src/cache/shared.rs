//! Shared (L2) tier abstraction.
//!
//! The trait keeps the orchestrator independent of the transport:
//! [`RedisTier`](super::redis::RedisTier) in production,
//! [`MemoryTier`](super::memory::MemoryTier) in tests and local development.
//! Implementations own payload encoding (see [`codec`](super::codec)).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BackendError, ScanDeleteError};

/// Memory usage as reported by the shared tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Bytes in use.
    pub used: u64,
    /// Configured ceiling in bytes; 0 means no ceiling.
    pub max: u64,
    /// Backend eviction policy, e.g. `allkeys-lru`.
    pub policy: String,
}

#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Fetch and decode a value. Undecodable payloads come back as strings.
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Encode and store a value with an expiry.
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// One SCAN step. Returns the next cursor (0 when complete) and a batch
    /// of matching keys.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError>;

    /// Delete a batch of keys, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError>;

    async fn memory_info(&self) -> Result<MemoryInfo, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Delete every key matching `pattern`, scanning in batches of
    /// `batch_size` until the cursor wraps.
    async fn scan_delete(&self, pattern: &str, batch_size: usize) -> Result<u64, ScanDeleteError> {
        let mut cursor = 0;
        let mut deleted = 0;

        loop {
            let (next, keys) = self
                .scan(cursor, pattern, batch_size)
                .await
                .map_err(|source| ScanDeleteError { deleted, source })?;

            if !keys.is_empty() {
                deleted += self
                    .delete_many(&keys)
                    .await
                    .map_err(|source| ScanDeleteError { deleted, source })?;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }
}
