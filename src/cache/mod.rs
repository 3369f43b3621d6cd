//! The multi-tier content cache: backend contract, the four backends,
//! the manager that owns the active one, and the capacity watchdog.

pub mod backend;
pub mod capacity;
pub mod cassandra;
pub mod hybrid;
pub mod item;
pub mod manager;
pub mod memory;
pub mod redis;

pub use backend::CacheBackend;
pub use capacity::{CapacityManager, CycleReport};
pub use cassandra::CassandraBackend;
pub use hybrid::HybridBackend;
pub use item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions, cache_key};
pub use manager::CacheManager;
pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use redis::RedisBackend;
