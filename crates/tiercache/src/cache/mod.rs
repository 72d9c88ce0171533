//! Two-tier caching with stampede protection and memory backpressure.
//!
//! ## Architecture
//!
//! - **L1 (DashMap)**: In-memory, bounded, per-process
//! - **L2 (Redis)**: Network, shared across processes
//! - **Lock registry (moka)**: One loader per key per process
//! - **Pressure monitor**: Shrinks TTLs and skips writes as Redis fills up
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get_with → L1 → L2 → per-key lock → loader
//!             ↓     ↓                    ↓
//!          <1µs   ~1ms            write back (TTL by pressure)
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is unavailable or disabled, the layer runs L1-only. Redis errors
//! during operation are counted and otherwise ignored.

pub mod codec;
pub mod keys;
pub mod layer;
pub mod local;
pub mod locks;
pub mod memory;
pub mod pressure;
pub mod redis;
pub mod shared;
pub mod stats;

pub use keys::CacheKeys;
pub use layer::CacheLayer;
pub use local::LocalTier;
pub use locks::LockRegistry;
pub use memory::MemoryTier;
pub use pressure::{PressureBand, PressureMonitor, PressureSnapshot, effective_ttl};
pub use self::redis::RedisTier;
pub use shared::{MemoryInfo, SharedTier};
pub use stats::{CacheStats, StatsRecorder};
