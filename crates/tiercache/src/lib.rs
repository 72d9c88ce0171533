pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;

pub use cache::{
    CacheKeys, CacheLayer, CacheStats, MemoryInfo, MemoryTier, PressureBand, PressureSnapshot,
    RedisTier, SharedTier,
};
pub use config::{CacheConfig, CacheSettings, LoggingConfig, RedisConfig};
pub use error::{BackendError, CacheError, ScanDeleteError};
pub use observability::{init_tracing, init_tracing_from};
