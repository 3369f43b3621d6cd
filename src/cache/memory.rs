//! In-process cache backend.
//!
//! Bounded by item count and total bytes with exact accounting. Admission
//! over the byte ceiling triggers a bulk eviction of roughly 20% of keys
//! in insertion order; TTL is enforced lazily on reads plus a periodic
//! sweep.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::CacheBackend;
use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};

pub struct MemoryBackendConfig {
    pub max_items: u64,
    pub max_size_bytes: u64,
    pub default_ttl: Duration,
    pub check_period: Duration,
}

struct Inner {
    items: DashMap<String, CacheItem>,
    /// Insertion order, the eviction-order proxy.
    order: Mutex<VecDeque<String>>,
    used_bytes: AtomicU64,
    max_items: u64,
    max_bytes: u64,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    connected: AtomicBool,
}

impl Inner {
    fn drop_entry(&self, key: &str) -> Option<CacheItem> {
        let removed = self.items.remove(key).map(|(_, item)| item);
        if let Some(item) = &removed {
            self.used_bytes.fetch_sub(item.size, Ordering::Relaxed);
            self.order.lock().retain(|k| k != key);
        }
        removed
    }

    /// Drop roughly 20% of keys, oldest insertions first.
    fn evict_bulk(&self) -> usize {
        let victims: Vec<String> = {
            let order = self.order.lock();
            let count = (order.len() as f64 * 0.2).ceil().max(1.0) as usize;
            order.iter().take(count).cloned().collect()
        };
        let mut evicted = 0;
        for key in victims {
            if self.drop_entry(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.drop_entry(&key);
        }
        count
    }
}

/// Bounded in-process store. Also the fallback when a remote backend
/// cannot initialize.
pub struct MemoryBackend {
    inner: Arc<Inner>,
    check_period: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: DashMap::new(),
                order: Mutex::new(VecDeque::new()),
                used_bytes: AtomicU64::new(0),
                max_items: config.max_items,
                max_bytes: config.max_size_bytes,
                default_ttl: config.default_ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                sets: AtomicU64::new(0),
                connected: AtomicBool::new(false),
            }),
            check_period: config.check_period,
            sweeper: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let period = self.check_period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = inner.sweep_expired();
                if removed > 0 {
                    debug!(count = removed, "[memory] swept expired items");
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
        self.inner.connected.store(true, Ordering::Relaxed);
        info!(
            max_items = self.inner.max_items,
            max_bytes = self.inner.max_bytes,
            "memory cache backend initialized"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let expired = match self.inner.items.get(key) {
            Some(entry) => entry.value().is_expired(),
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            self.inner.drop_entry(key);
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let item = {
            let mut entry = self.inner.items.get_mut(key)?;
            entry.value_mut().hit_count += 1;
            entry.value().clone()
        };
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let size = data.len() as u64;
        if size > self.inner.max_bytes {
            return false;
        }

        let fits = |inner: &Inner| {
            let replaced = inner.items.get(key).map_or(0, |e| e.value().size);
            let used_after = inner.used_bytes.load(Ordering::Relaxed) - replaced + size;
            let count_after =
                inner.items.len() as u64 + u64::from(!inner.items.contains_key(key));
            used_after <= inner.max_bytes && count_after <= inner.max_items
        };

        if !fits(&self.inner) {
            let evicted = self.inner.evict_bulk();
            debug!(count = evicted, "[memory] bulk eviction under pressure");
            if !fits(&self.inner) {
                return false;
            }
        }

        let ttl = opts.ttl.unwrap_or(self.inner.default_ttl);
        let item = CacheItem::new(data, ttl, &opts);
        if let Some(old) = self.inner.items.insert(key.to_string(), item) {
            self.inner.used_bytes.fetch_sub(old.size, Ordering::Relaxed);
            self.inner.order.lock().retain(|k| k != key);
        }
        self.inner.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.inner.order.lock().push_back(key.to_string());
        self.inner.sets.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn delete(&self, key: &str) -> bool {
        self.inner.drop_entry(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        match self.inner.items.get(key) {
            Some(entry) => !entry.value().is_expired(),
            None => false,
        }
    }

    async fn clear(&self) -> bool {
        self.inner.items.clear();
        self.inner.order.lock().clear();
        self.inner.used_bytes.store(0, Ordering::Relaxed);
        true
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        CacheStats {
            backend: self.name().to_string(),
            hits,
            misses,
            errors: self.inner.errors.load(Ordering::Relaxed),
            sets: self.inner.sets.load(Ordering::Relaxed),
            items: self.inner.items.len() as u64,
            used_bytes: self.inner.used_bytes.load(Ordering::Relaxed),
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: self.inner.connected.load(Ordering::Relaxed),
        }
    }

    async fn is_healthy(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.inner.connected.store(false, Ordering::Relaxed);
    }

    async fn capacity(&self) -> CapacityInfo {
        let used = self.inner.used_bytes.load(Ordering::Relaxed);
        CapacityInfo {
            used_bytes: used,
            max_bytes: self.inner.max_bytes,
            used_percentage: CapacityInfo::percentage(used, self.inner.max_bytes),
            item_count: self.inner.items.len() as u64,
            max_items: self.inner.max_items,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount> {
        let mut entries: Vec<KeyHitCount> = self
            .inner
            .items
            .iter()
            .filter(|e| !e.value().is_expired())
            .map(|e| KeyHitCount {
                key: e.key().clone(),
                hit_count: e.value().hit_count,
            })
            .collect();
        entries.sort_by_key(|e| e.hit_count);
        entries.truncate(limit);
        entries
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        match self.inner.items.get_mut(key) {
            Some(mut entry) => {
                entry.value_mut().hit_count += 1;
                true
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(max_items: u64, max_bytes: u64) -> MemoryBackend {
        MemoryBackend::new(MemoryBackendConfig {
            max_items,
            max_size_bytes: max_bytes,
            default_ttl: Duration::from_secs(60),
            check_period: Duration::from_secs(600),
        })
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = backend(10, 1024);
        assert!(cache.set("k", Bytes::from_static(b"abc"), SetOptions::default()).await);
        let item = cache.get("k").await.expect("item present");
        assert_eq!(&item.data[..], b"abc");
        assert_eq!(item.size, 3);
        assert!(!item.is_expired());
    }

    #[tokio::test]
    async fn delete_removes_item() {
        let cache = backend(10, 1024);
        cache.set("k", Bytes::from_static(b"abc"), SetOptions::default()).await;
        assert!(cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert!(cache.get("k").await.is_none());
        assert!(!cache.delete("k").await);
    }

    #[tokio::test]
    async fn expired_item_is_a_miss_and_is_removed() {
        let cache = backend(10, 1024);
        cache
            .set(
                "k",
                Bytes::from_static(b"abc"),
                SetOptions::with_ttl(Duration::from_millis(20)),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").await.is_none());
        assert!(!cache.exists("k").await);
        // Byte accounting followed the removal.
        assert_eq!(cache.capacity().await.used_bytes, 0);
    }

    #[tokio::test]
    async fn oversize_item_is_rejected_without_side_effects() {
        let cache = backend(10, 8);
        cache.set("small", Bytes::from_static(b"abc"), SetOptions::default()).await;
        assert!(
            !cache
                .set("big", Bytes::from(vec![0u8; 9]), SetOptions::default())
                .await
        );
        assert!(cache.exists("small").await);
        assert_eq!(cache.capacity().await.used_bytes, 3);
    }

    #[tokio::test]
    async fn admission_pressure_evicts_oldest_first() {
        let cache = backend(100, 10);
        for i in 0..5 {
            assert!(
                cache
                    .set(&format!("k{i}"), Bytes::from(vec![b'x'; 2]), SetOptions::default())
                    .await
            );
        }
        // Full at 10 bytes; the next item forces a bulk eviction (20% of
        // five keys, so one key, the oldest insertion) before admission.
        assert!(cache.set("new", Bytes::from(vec![b'y'; 2]), SetOptions::default()).await);
        assert!(!cache.exists("k0").await);
        assert!(cache.exists("new").await);
        let cap = cache.capacity().await;
        assert_eq!(cap.used_bytes, 10);
    }

    #[tokio::test]
    async fn used_bytes_matches_live_items() {
        let cache = backend(100, 1024);
        cache.set("a", Bytes::from(vec![0u8; 10]), SetOptions::default()).await;
        cache.set("b", Bytes::from(vec![0u8; 20]), SetOptions::default()).await;
        // Replacement under the same key swaps the accounted size.
        cache.set("a", Bytes::from(vec![0u8; 5]), SetOptions::default()).await;
        assert_eq!(cache.capacity().await.used_bytes, 25);
        cache.delete("b").await;
        assert_eq!(cache.capacity().await.used_bytes, 5);
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let cache = backend(100, 1024);
        cache.set("a", Bytes::from_static(b"1"), SetOptions::default()).await;
        cache.set("b", Bytes::from_static(b"2"), SetOptions::default()).await;
        assert!(cache.clear().await);
        assert_eq!(cache.stats().await.items, 0);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_none());
    }

    #[tokio::test]
    async fn items_by_hit_count_is_ascending_and_bounded() {
        let cache = backend(100, 1024);
        for i in 0..4 {
            cache
                .set(&format!("k{i}"), Bytes::from_static(b"x"), SetOptions::default())
                .await;
        }
        // k3 read three times, k2 twice, k1 once, k0 never.
        for _ in 0..3 {
            cache.get("k3").await;
        }
        for _ in 0..2 {
            cache.get("k2").await;
        }
        cache.get("k1").await;

        let ranked = cache.items_by_hit_count(3).await;
        assert_eq!(ranked.len(), 3);
        let counts: Vec<u64> = ranked.iter().map(|e| e.hit_count).collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ranked[0].key, "k0");
    }

    #[tokio::test]
    async fn get_bumps_hit_count_monotonically() {
        let cache = backend(100, 1024);
        cache.set("k", Bytes::from_static(b"x"), SetOptions::default()).await;
        assert_eq!(cache.get("k").await.unwrap().hit_count, 1);
        assert_eq!(cache.get("k").await.unwrap().hit_count, 2);
        assert!(cache.increment_hit_count("k").await);
        assert_eq!(cache.get("k").await.unwrap().hit_count, 4);
        assert!(!cache.increment_hit_count("missing").await);
    }

    #[tokio::test]
    async fn max_items_ceiling_is_enforced() {
        let cache = backend(3, 1024);
        for i in 0..3 {
            assert!(
                cache
                    .set(&format!("k{i}"), Bytes::from_static(b"x"), SetOptions::default())
                    .await
            );
        }
        // Fourth insert evicts the oldest key to stay under the ceiling.
        assert!(cache.set("k3", Bytes::from_static(b"x"), SetOptions::default()).await);
        assert!(cache.capacity().await.item_count <= 3);
        assert!(!cache.exists("k0").await);
    }
}
