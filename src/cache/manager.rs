//! Cache manager: owns the selected backend and its lifecycle.
//!
//! Construction is cheap; `init` builds and initializes the configured
//! backend and falls back to the memory backend when a remote mode cannot
//! come up. The backend can be swapped at runtime; a switch is a clean
//! re-initialization, nothing is carried over.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::backend::CacheBackend;
use super::cassandra::CassandraBackend;
use super::hybrid::HybridBackend;
use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};
use super::memory::{MemoryBackend, MemoryBackendConfig};
use super::redis::RedisBackend;
use crate::config::{CacheMode, Config};

struct ManagerState {
    mode: CacheMode,
    backend: Arc<dyn CacheBackend>,
    /// Kept alongside the trait object so the capacity watchdog can reach
    /// the individual tiers.
    hybrid: Option<Arc<HybridBackend>>,
    initialized: bool,
    fallback_occurred: bool,
}

/// Snapshot of the active backend handed to the capacity watchdog.
#[derive(Clone)]
pub struct BackendSnapshot {
    pub mode: CacheMode,
    pub backend: Arc<dyn CacheBackend>,
    pub hybrid: Option<Arc<HybridBackend>>,
}

pub struct CacheManager {
    config: Config,
    state: RwLock<ManagerState>,
}

impl CacheManager {
    pub fn new(config: Config) -> Self {
        let memory = Arc::new(MemoryBackend::new(Self::memory_config(&config)));
        Self {
            state: RwLock::new(ManagerState {
                mode: CacheMode::Memory,
                backend: memory,
                hybrid: None,
                initialized: false,
                fallback_occurred: false,
            }),
            config,
        }
    }

    /// Wrap an already-built backend. Used when embedding the manager
    /// around custom tiers (and by the integration tests).
    pub fn with_backend(config: Config, mode: CacheMode, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                mode,
                backend,
                hybrid: None,
                initialized: true,
                fallback_occurred: false,
            }),
            config,
        }
    }

    /// Wrap an already-built hybrid composition.
    pub fn with_hybrid(config: Config, hybrid: Arc<HybridBackend>) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                mode: CacheMode::RedisCassandra,
                backend: hybrid.clone(),
                hybrid: Some(hybrid),
                initialized: true,
                fallback_occurred: false,
            }),
            config,
        }
    }

    fn memory_config(config: &Config) -> MemoryBackendConfig {
        MemoryBackendConfig {
            max_items: config.cache.max_items,
            max_size_bytes: config.cache.max_size_bytes,
            default_ttl: config.cache.ttl,
            check_period: config.cache.check_period,
        }
    }

    fn build(&self, mode: CacheMode) -> (Arc<dyn CacheBackend>, Option<Arc<HybridBackend>>) {
        match mode {
            CacheMode::Memory => (
                Arc::new(MemoryBackend::new(Self::memory_config(&self.config))),
                None,
            ),
            CacheMode::Redis => (
                Arc::new(RedisBackend::new(
                    self.config.redis.clone(),
                    self.config.cache.ttl,
                    self.config.cache.redis_memory_threshold,
                )),
                None,
            ),
            CacheMode::Cassandra => (
                Arc::new(CassandraBackend::new(
                    self.config.cassandra.clone(),
                    self.config.cache.ttl,
                    self.config.cache.cassandra_max_files,
                )),
                None,
            ),
            CacheMode::RedisCassandra => {
                let l1 = Arc::new(RedisBackend::new(
                    self.config.redis.clone(),
                    self.config.cache.ttl,
                    self.config.cache.redis_memory_threshold,
                ));
                let l2 = Arc::new(CassandraBackend::new(
                    self.config.cassandra.clone(),
                    self.config.cache.ttl,
                    self.config.cache.cassandra_max_files,
                ));
                let hybrid = Arc::new(HybridBackend::new(l1, l2));
                (hybrid.clone(), Some(hybrid))
            }
        }
    }

    /// Build and initialize the backend, falling back to memory when a
    /// remote mode cannot come up.
    async fn bring_up(&self, mode: CacheMode) -> ManagerState {
        let (backend, hybrid) = self.build(mode);
        match backend.initialize().await {
            Ok(()) => {
                info!(mode = %mode, "cache backend initialized");
                return ManagerState {
                    mode,
                    backend,
                    hybrid,
                    initialized: true,
                    fallback_occurred: false,
                };
            }
            Err(e) => {
                error!(mode = %mode, error = %e, "cache backend failed to initialize");
            }
        }

        if mode == CacheMode::Memory {
            // Memory initialization cannot realistically fail, but keep
            // the manager in a safe uninitialized state if it ever does.
            return ManagerState {
                mode,
                backend,
                hybrid,
                initialized: false,
                fallback_occurred: false,
            };
        }

        warn!(requested = %mode, "falling back to memory cache backend");
        let (memory, _) = self.build(CacheMode::Memory);
        let initialized = match memory.initialize().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "memory fallback failed to initialize");
                false
            }
        };
        ManagerState {
            mode: CacheMode::Memory,
            backend: memory,
            hybrid: None,
            initialized,
            fallback_occurred: true,
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mode = self.config.cache.mode;
        let next = self.bring_up(mode).await;
        *self.state.write().await = next;
        Ok(())
    }

    /// Close the current backend and bring up `mode` in its place. On
    /// failure the memory backend is the last resort; the returned mode is
    /// whatever actually came up.
    pub async fn switch_backend(&self, mode: CacheMode) -> Result<CacheMode> {
        {
            let state = self.state.read().await;
            state.backend.close().await;
        }
        let next = self.bring_up(mode).await;
        let actual = next.mode;
        *self.state.write().await = next;
        info!(requested = %mode, actual = %actual, "cache backend switched");
        Ok(actual)
    }

    pub async fn close(&self) {
        let state = self.state.read().await;
        if state.initialized {
            state.backend.close().await;
        }
    }

    pub async fn mode(&self) -> CacheMode {
        self.state.read().await.mode
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn fallback_occurred(&self) -> bool {
        self.state.read().await.fallback_occurred
    }

    pub async fn snapshot(&self) -> Option<BackendSnapshot> {
        let state = self.state.read().await;
        state.initialized.then(|| BackendSnapshot {
            mode: state.mode,
            backend: Arc::clone(&state.backend),
            hybrid: state.hybrid.clone(),
        })
    }

    async fn backend(&self) -> Option<Arc<dyn CacheBackend>> {
        let state = self.state.read().await;
        state.initialized.then(|| Arc::clone(&state.backend))
    }

    // Pass-throughs. Each short-circuits to a safe default when the
    // manager is not initialized.

    pub async fn get(&self, key: &str) -> Option<CacheItem> {
        self.backend().await?.get(key).await
    }

    pub async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        match self.backend().await {
            Some(backend) => backend.set(key, data, opts).await,
            None => false,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.backend().await {
            Some(backend) => backend.delete(key).await,
            None => false,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.backend().await {
            Some(backend) => backend.exists(key).await,
            None => false,
        }
    }

    pub async fn clear(&self) -> bool {
        match self.backend().await {
            Some(backend) => backend.clear().await,
            None => false,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        match self.backend().await {
            Some(backend) => backend.stats().await,
            None => CacheStats {
                backend: self.mode().await.as_str().to_string(),
                hits: 0,
                misses: 0,
                errors: 0,
                sets: 0,
                items: 0,
                used_bytes: 0,
                hit_ratio: 0.0,
                connected: false,
            },
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self.backend().await {
            Some(backend) => backend.is_healthy().await,
            None => false,
        }
    }

    pub async fn capacity(&self) -> CapacityInfo {
        match self.backend().await {
            Some(backend) => backend.capacity().await,
            None => CapacityInfo::default(),
        }
    }

    pub async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount> {
        match self.backend().await {
            Some(backend) => backend.items_by_hit_count(limit).await,
            None => Vec::new(),
        }
    }

    pub async fn increment_hit_count(&self, key: &str) -> bool {
        match self.backend().await {
            Some(backend) => backend.increment_hit_count(key).await,
            None => false,
        }
    }
}
