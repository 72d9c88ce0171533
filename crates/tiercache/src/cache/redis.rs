//! Redis-backed shared tier.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, IntoConnectionInfo};
use serde_json::Value;

use super::codec;
use super::shared::{MemoryInfo, SharedTier};
use crate::config::RedisConfig;
use crate::error::{BackendError, CacheError};

/// Shared tier over a `deadpool-redis` pool.
///
/// Every command, including the pool checkout, is bounded by the configured
/// timeout so a stalled Redis surfaces as [`BackendError::Timeout`] instead
/// of hanging the caller.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    timeout: Duration,
}

impl RedisTier {
    /// Build the pool without connecting.
    ///
    /// A malformed URL is a configuration error; an unreachable server is
    /// not detected here (see [`SharedTier::ping`]).
    pub fn new(config: &RedisConfig) -> Result<Self, CacheError> {
        config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| CacheError::Config(format!("invalid redis.url: {e}")))?;

        let timeout = config.timeout();
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts = deadpool_redis::Timeouts {
            wait: Some(timeout),
            create: Some(timeout),
            recycle: Some(timeout),
        };

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::Config(format!("failed to create Redis pool: {e}")))?;

        Ok(Self { pool, timeout })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, BackendError> {
        Ok(self.pool.get().await?)
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: std::future::Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "{op} exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl SharedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.timed("GET", async {
            let mut conn = self.conn().await?;
            let raw: Option<Vec<u8>> = conn.get(key).await?;
            Ok(raw.map(|bytes| {
                let text = String::from_utf8(bytes)
                    .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
                codec::decode(text)
            }))
        })
        .await
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), BackendError> {
        let payload = codec::encode(value);
        // EX 0 is rejected by Redis.
        let ttl_secs = ttl.as_secs().max(1);
        self.timed("SET", async {
            let mut conn = self.conn().await?;
            conn.set_ex::<_, _, ()>(key, payload, ttl_secs).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.timed("DEL", async {
            let mut conn = self.conn().await?;
            conn.del::<_, ()>(key).await?;
            Ok(())
        })
        .await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        self.timed("SCAN", async {
            let mut conn = self.conn().await?;
            let reply: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(reply)
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.timed("DEL", async {
            let mut conn = self.conn().await?;
            let deleted: u64 = conn.del(keys).await?;
            Ok(deleted)
        })
        .await
    }

    async fn memory_info(&self) -> Result<MemoryInfo, BackendError> {
        self.timed("INFO", async {
            let mut conn = self.conn().await?;
            let info: String = redis::cmd("INFO")
                .arg("memory")
                .query_async(&mut conn)
                .await?;
            parse_memory_info(&info)
        })
        .await
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.timed("PING", async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

/// Extract `used_memory`, `maxmemory` and `maxmemory_policy` from an
/// `INFO memory` reply.
pub(crate) fn parse_memory_info(info: &str) -> Result<MemoryInfo, BackendError> {
    let mut used = None;
    let mut max = None;
    let mut policy = None;

    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory" => used = value.parse::<u64>().ok(),
            "maxmemory" => max = value.parse::<u64>().ok(),
            "maxmemory_policy" => policy = Some(value.to_string()),
            _ => {}
        }
    }

    let used =
        used.ok_or_else(|| BackendError::Protocol("INFO memory lacks used_memory".into()))?;

    Ok(MemoryInfo {
        used,
        // Older servers and some managed offerings omit maxmemory.
        max: max.unwrap_or(0),
        policy: policy.unwrap_or_else(|| "unknown".into()),
    })
}
