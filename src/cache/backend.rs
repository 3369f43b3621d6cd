//! The uniform contract every cache backend implements.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};

/// Pluggable cache backend.
///
/// Apart from `initialize`, every operation is total: backends never
/// propagate store errors to callers. A failed get is a miss, a failed
/// mutation reports `false`, and the fault increments the backend's
/// internal `errors` counter, visible through [`CacheBackend::stats`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Establish connections and bootstrap any remote schema. The only
    /// fallible entry point; the cache manager falls back to the memory
    /// backend when this fails.
    async fn initialize(&self) -> Result<()>;

    /// Fetch an item. Observing an expired item behaves as a miss and
    /// removes it. A hit bumps the item's hit count.
    async fn get(&self, key: &str) -> Option<CacheItem>;

    /// Store an item, replacing any prior one under the same key. Returns
    /// `false` when admission is refused (capacity) or the store failed.
    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool;

    /// Remove an item. `true` when an item was present and removed.
    async fn delete(&self, key: &str) -> bool;

    /// Whether a live (non-expired) item exists under the key.
    async fn exists(&self, key: &str) -> bool;

    /// Drop every item this node owns. Remote backends only touch keys
    /// under their own scope.
    async fn clear(&self) -> bool;

    /// Counter snapshot plus current occupancy.
    async fn stats(&self) -> CacheStats;

    /// Cheap liveness probe.
    async fn is_healthy(&self) -> bool;

    /// Idempotently release held connections and background tasks.
    async fn close(&self);

    /// Occupancy as used by the capacity watchdog.
    async fn capacity(&self) -> CapacityInfo;

    /// Up to `limit` keys ordered by ascending hit count. Best effort: a
    /// backend may return fewer than requested. Ties break arbitrarily.
    async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount>;

    /// Atomically bump an existing item's hit count.
    async fn increment_hit_count(&self, key: &str) -> bool;

    fn name(&self) -> &'static str {
        "unknown"
    }
}
