//! Hybrid backend composing a fast L1 tier with a persistent L2 tier.
//!
//! Reads go through L1 first; an L1 miss that hits L2 promotes the item
//! back into L1 with its remaining TTL. Writes, deletes and hit-count
//! bumps go to both tiers and succeed when at least one tier succeeds, so
//! the composition stays available while either store is down.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};

pub struct HybridBackend {
    l1: Arc<dyn CacheBackend>,
    l2: Arc<dyn CacheBackend>,
    /// Bounds the fire-and-forget promotion tasks so `close` can await
    /// in-flight work instead of leaking it.
    promotions: TaskTracker,
    promoted: AtomicU64,
}

impl HybridBackend {
    pub fn new(l1: Arc<dyn CacheBackend>, l2: Arc<dyn CacheBackend>) -> Self {
        Self {
            l1,
            l2,
            promotions: TaskTracker::new(),
            promoted: AtomicU64::new(0),
        }
    }

    pub fn l1(&self) -> Arc<dyn CacheBackend> {
        Arc::clone(&self.l1)
    }

    pub fn l2(&self) -> Arc<dyn CacheBackend> {
        Arc::clone(&self.l2)
    }

    pub fn promotion_count(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }

    /// Copy an L2 hit into L1 without blocking the caller. The promoted
    /// copy carries the item's remaining TTL so it never outlives the L2
    /// row.
    fn promote(&self, key: &str, item: &CacheItem) {
        if self.promotions.is_closed() {
            return;
        }
        let l1 = Arc::clone(&self.l1);
        let key = key.to_string();
        let data = item.data.clone();
        let opts = SetOptions::from_item(item);
        self.promoted.fetch_add(1, Ordering::Relaxed);
        self.promotions.spawn(async move {
            if l1.set(&key, data, opts).await {
                debug!(key = %key, "[hybrid] promoted item to L1");
            } else {
                warn!(key = %key, "[hybrid] promotion to L1 failed");
            }
        });
    }
}

#[async_trait]
impl CacheBackend for HybridBackend {
    async fn initialize(&self) -> Result<()> {
        let (l1_result, l2_result) = tokio::join!(self.l1.initialize(), self.l2.initialize());
        match (l1_result, l2_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                warn!(error = %e, "[hybrid] L2 unavailable, continuing on L1 only");
                Ok(())
            }
            (Err(e), Ok(())) => {
                warn!(error = %e, "[hybrid] L1 unavailable, continuing on L2 only");
                Ok(())
            }
            (Err(e1), Err(e2)) => Err(anyhow::anyhow!(
                "both cache tiers failed to initialize: L1: {e1}; L2: {e2}"
            )),
        }
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        if let Some(item) = self.l1.get(key).await {
            return Some(item);
        }
        let item = self.l2.get(key).await?;
        self.promote(key, &item);
        Some(item)
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let (l1_ok, l2_ok) = tokio::join!(
            self.l1.set(key, data.clone(), opts.clone()),
            self.l2.set(key, data, opts)
        );
        if !l1_ok && l2_ok {
            warn!(key = %key, "[hybrid] L1 set failed, item persisted in L2 only");
        } else if l1_ok && !l2_ok {
            warn!(key = %key, "[hybrid] L2 set failed, item held in L1 only");
        }
        l1_ok || l2_ok
    }

    async fn delete(&self, key: &str) -> bool {
        let (l1_ok, l2_ok) = tokio::join!(self.l1.delete(key), self.l2.delete(key));
        l1_ok || l2_ok
    }

    async fn exists(&self, key: &str) -> bool {
        self.l1.exists(key).await || self.l2.exists(key).await
    }

    async fn clear(&self) -> bool {
        let (l1_ok, l2_ok) = tokio::join!(self.l1.clear(), self.l2.clear());
        l1_ok || l2_ok
    }

    async fn stats(&self) -> CacheStats {
        let (l1, l2) = tokio::join!(self.l1.stats(), self.l2.stats());
        let hits = l1.hits + l2.hits;
        let misses = l1.misses + l2.misses;
        CacheStats {
            backend: self.name().to_string(),
            hits,
            misses,
            errors: l1.errors + l2.errors,
            sets: l1.sets + l2.sets,
            items: l1.items + l2.items,
            used_bytes: l1.used_bytes + l2.used_bytes,
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: l1.connected || l2.connected,
        }
    }

    async fn is_healthy(&self) -> bool {
        let (l1, l2) = tokio::join!(self.l1.is_healthy(), self.l2.is_healthy());
        l1 || l2
    }

    async fn close(&self) {
        self.promotions.close();
        self.promotions.wait().await;
        tokio::join!(self.l1.close(), self.l2.close());
    }

    async fn capacity(&self) -> CapacityInfo {
        let (l1, l2) = tokio::join!(self.l1.capacity(), self.l2.capacity());
        let used = l1.used_bytes + l2.used_bytes;
        let max = l1.max_bytes + l2.max_bytes;
        CapacityInfo {
            used_bytes: used,
            max_bytes: max,
            used_percentage: CapacityInfo::percentage(used, max),
            item_count: l1.item_count + l2.item_count,
            max_items: l1.max_items + l2.max_items,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount> {
        let (l1, l2) = tokio::join!(
            self.l1.items_by_hit_count(usize::MAX),
            self.l2.items_by_hit_count(usize::MAX)
        );
        let mut merged: HashMap<String, u64> = HashMap::new();
        for entry in l1.into_iter().chain(l2) {
            *merged.entry(entry.key).or_insert(0) += entry.hit_count;
        }
        let mut entries: Vec<KeyHitCount> = merged
            .into_iter()
            .map(|(key, hit_count)| KeyHitCount { key, hit_count })
            .collect();
        entries.sort_by_key(|e| e.hit_count);
        entries.truncate(limit);
        entries
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        let (l1_ok, l2_ok) = tokio::join!(
            self.l1.increment_hit_count(key),
            self.l2.increment_hit_count(key)
        );
        l1_ok || l2_ok
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
