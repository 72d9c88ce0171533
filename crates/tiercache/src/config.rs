use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum idle window for per-key locks. Locks reclaimed while a loader is
/// still running would let a second caller into the critical section.
const MIN_LOCK_IDLE_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheSettings {
    /// Redis (shared tier) connection settings
    #[serde(default)]
    pub redis: RedisConfig,
    /// Tier sizing, TTLs and key namespace
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        // Redis validations
        if self.redis.enabled {
            if self.redis.url.trim().is_empty() {
                return Err("redis.url must not be empty when redis.enabled=true".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.timeout_ms == 0 {
                return Err("redis.timeout_ms must be > 0".into());
            }
        }
        // Tier validations
        let c = &self.cache;
        if c.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        if c.local_ttl_secs == 0 {
            return Err("cache.local_ttl_secs must be > 0".into());
        }
        if c.shared_ttl_secs == 0 {
            return Err("cache.shared_ttl_secs must be > 0".into());
        }
        if c.lock_max_entries == 0 {
            return Err("cache.lock_max_entries must be > 0".into());
        }
        if c.lock_idle_secs < MIN_LOCK_IDLE_SECS {
            return Err(format!(
                "cache.lock_idle_secs must be >= {MIN_LOCK_IDLE_SECS}"
            ));
        }
        if c.scan_batch_size == 0 {
            return Err("cache.scan_batch_size must be > 0".into());
        }
        if c.sweep_interval_secs == 0 {
            return Err("cache.sweep_interval_secs must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }
}

/// Redis configuration for the shared tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable the shared tier. When disabled, or when Redis is unreachable at
    /// startup, the cache runs local-only.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379/0")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-command and connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl RedisConfig {
    /// Bound applied to pool checkout and to every command.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix applied to every key in both tiers
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Local (L1) entry TTL in seconds
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,

    /// Default shared (L2) TTL in seconds, used when a write has no override
    #[serde(default = "default_shared_ttl_secs")]
    pub shared_ttl_secs: u64,

    /// How often the pressure monitor may query Redis memory usage
    #[serde(default = "default_pressure_refresh_secs")]
    pub pressure_refresh_secs: u64,

    /// Upper bound on per-key stampede locks kept in memory
    #[serde(default = "default_lock_max_entries")]
    pub lock_max_entries: u64,

    /// Idle time after which an unused per-key lock is reclaimed.
    /// Must comfortably exceed the slowest loader.
    #[serde(default = "default_lock_idle_secs")]
    pub lock_idle_secs: u64,

    /// COUNT hint for each SCAN batch during pattern deletes
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// Interval of the background sweep removing expired L1 entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_namespace() -> String {
    "appcache:".into()
}
fn default_local_max_entries() -> usize {
    2048
}
fn default_local_ttl_secs() -> u64 {
    60
}
fn default_shared_ttl_secs() -> u64 {
    300
}
fn default_pressure_refresh_secs() -> u64 {
    5
}
fn default_lock_max_entries() -> u64 {
    10_000
}
fn default_lock_idle_secs() -> u64 {
    300 // 5 minutes
}
fn default_scan_batch_size() -> usize {
    500
}
fn default_sweep_interval_secs() -> u64 {
    30
}

impl CacheConfig {
    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }
    pub fn shared_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_ttl_secs)
    }
    pub fn pressure_refresh(&self) -> Duration {
        Duration::from_secs(self.pressure_refresh_secs)
    }
    pub fn lock_idle(&self) -> Duration {
        Duration::from_secs(self.lock_idle_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            local_max_entries: default_local_max_entries(),
            local_ttl_secs: default_local_ttl_secs(),
            shared_ttl_secs: default_shared_ttl_secs(),
            pressure_refresh_secs: default_pressure_refresh_secs(),
            lock_max_entries: default_lock_max_entries(),
            lock_idle_secs: default_lock_idle_secs(),
            scan_batch_size: default_scan_batch_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::CacheSettings;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<CacheSettings, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("tiercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., TIERCACHE__CACHE__SHARED_TTL_SECS=600
        builder = builder.add_source(
            Environment::with_prefix("TIERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
