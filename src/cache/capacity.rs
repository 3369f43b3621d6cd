//! Capacity watchdog.
//!
//! Runs on its own timer, never blocking request flow. Over-threshold L1
//! occupancy migrates the coldest items into L2; over-threshold L2
//! occupancy evicts its coldest items. The read-then-act sequence takes
//! no locks, so a selected key may vanish or be re-admitted mid-cycle;
//! every step tolerates not-found and keeps going.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::item::SetOptions;
use super::manager::CacheManager;
use crate::config::{CacheMode, CapacityConfig};

/// Share of items selected when a tier crosses its threshold.
const L1_SELECTION_FRACTION: f64 = 0.2;
const L2_SELECTION_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    redis: f64,
    cassandra: f64,
}

/// Outcome of one watchdog cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub migrated: u64,
    pub evicted: u64,
    pub failed: u64,
}

pub struct CapacityManager {
    manager: Arc<CacheManager>,
    thresholds: Arc<Mutex<Thresholds>>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CapacityManager {
    pub fn new(manager: Arc<CacheManager>, config: &CapacityConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            thresholds: Arc::new(Mutex::new(Thresholds {
                redis: config.redis_threshold,
                cassandra: config.cassandra_threshold,
            })),
            interval: config.check_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the periodic watchdog task.
    pub fn start_monitoring(&self) {
        let manager = Arc::clone(&self.manager);
        let thresholds = Arc::clone(&self.thresholds);
        let cancel = self.cancel.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = run_cycle(&manager, &thresholds).await;
                        if report != CycleReport::default() {
                            info!(
                                migrated = report.migrated,
                                evicted = report.evicted,
                                failed = report.failed,
                                "capacity cycle acted"
                            );
                        }
                    }
                }
            }
            debug!("capacity watchdog stopped");
        });
        *self.task.lock() = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "capacity watchdog started");
    }

    /// Cancel the watchdog and wait for its in-flight tick to finish.
    pub async fn stop_monitoring(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Update thresholds at runtime. Both must lie strictly inside
    /// (0, 100).
    pub fn update_thresholds(&self, redis: Option<f64>, cassandra: Option<f64>) -> Result<()> {
        for value in [redis, cassandra].into_iter().flatten() {
            if !(value > 0.0 && value < 100.0) {
                bail!("capacity threshold {value} outside (0, 100)");
            }
        }
        let mut thresholds = self.thresholds.lock();
        if let Some(v) = redis {
            thresholds.redis = v;
        }
        if let Some(v) = cassandra {
            thresholds.cassandra = v;
        }
        Ok(())
    }

    /// Run one capacity cycle on demand.
    pub async fn force_check(&self) -> CycleReport {
        run_cycle(&self.manager, &self.thresholds).await
    }
}

async fn run_cycle(manager: &CacheManager, thresholds: &Mutex<Thresholds>) -> CycleReport {
    let Some(snapshot) = manager.snapshot().await else {
        return CycleReport::default();
    };
    let thresholds = *thresholds.lock();
    let mut report = CycleReport::default();

    match snapshot.mode {
        // Memory self-manages through admission eviction.
        CacheMode::Memory => {}
        CacheMode::Redis => {
            evict_if_over(
                snapshot.backend,
                thresholds.redis,
                L1_SELECTION_FRACTION,
                &mut report,
            )
            .await;
        }
        CacheMode::Cassandra => {
            evict_if_over(
                snapshot.backend,
                thresholds.cassandra,
                L2_SELECTION_FRACTION,
                &mut report,
            )
            .await;
        }
        CacheMode::RedisCassandra => {
            let Some(hybrid) = snapshot.hybrid else {
                return report;
            };
            let l1 = hybrid.l1();
            let l2 = hybrid.l2();

            let l1_capacity = l1.capacity().await;
            if l1_capacity.used_percentage >= thresholds.redis {
                migrate_coldest(&l1, &l2, &mut report).await;
            }

            evict_if_over(l2, thresholds.cassandra, L2_SELECTION_FRACTION, &mut report).await;
        }
    }
    report
}

fn selection_size(item_count: u64, fraction: f64) -> usize {
    ((item_count as f64 * fraction).ceil() as usize).max(1)
}

async fn evict_if_over(
    backend: Arc<dyn CacheBackend>,
    threshold: f64,
    fraction: f64,
    report: &mut CycleReport,
) {
    let capacity = backend.capacity().await;
    if capacity.used_percentage < threshold {
        return;
    }
    let count = selection_size(capacity.item_count, fraction);
    let victims = backend.items_by_hit_count(count).await;
    debug!(
        backend = backend.name(),
        used_pct = capacity.used_percentage,
        selected = victims.len(),
        "evicting least-used items"
    );
    for victim in victims {
        if backend.delete(&victim.key).await {
            report.evicted += 1;
        }
        // A miss here means the item expired or was deleted since
        // selection; nothing to do.
    }
}

/// Move the coldest L1 items into L2, preserving metadata and the
/// remaining lifetime, then drop them from L1.
async fn migrate_coldest(
    l1: &Arc<dyn CacheBackend>,
    l2: &Arc<dyn CacheBackend>,
    report: &mut CycleReport,
) {
    let capacity = l1.capacity().await;
    let count = selection_size(capacity.item_count, L1_SELECTION_FRACTION);
    let victims = l1.items_by_hit_count(count).await;
    debug!(
        used_pct = capacity.used_percentage,
        selected = victims.len(),
        "migrating least-used items from L1 to L2"
    );

    for victim in victims {
        let Some(item) = l1.get(&victim.key).await else {
            continue;
        };
        let opts = SetOptions::from_item(&item);
        if l2.set(&victim.key, item.data.clone(), opts).await {
            l1.delete(&victim.key).await;
            report.migrated += 1;
        } else {
            report.failed += 1;
            warn!(key = %victim.key, "migration to L2 failed, item stays in L1");
        }
    }
}
