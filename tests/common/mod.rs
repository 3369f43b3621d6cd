//! Shared test infrastructure: in-process backends, a mock origin, and
//! app construction helpers.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use vod_edge::cache::capacity::CapacityManager;
use vod_edge::cache::manager::CacheManager;
use vod_edge::cache::{
    CacheBackend, CacheItem, CacheStats, CapacityInfo, KeyHitCount, MemoryBackend,
    MemoryBackendConfig, SetOptions,
};
use vod_edge::config::{
    CacheConfig, CacheMode, CapacityConfig, CassandraConfig, Config, OriginConfig, RedisConfig,
    ServerConfig,
};
use vod_edge::origin::{BodyStream, FetchedObject, ObjectMetadata, ObjectStore, OriginError};
use vod_edge::serve::{AppState, router};

pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

pub fn test_config(mode: CacheMode) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            environment: "test".into(),
            log_level: "warn".into(),
            cdn_base_path: "cdn".into(),
            proxy_base_path: "proxy".into(),
        },
        origin: OriginConfig {
            endpoint: "http://127.0.0.1:9000".into(),
            access_key_id: "test".into(),
            secret_access_key: "test".into(),
            region: "us-east-1".into(),
            default_bucket: "vod".into(),
            force_path_style: true,
            use_ssl: false,
            request_timeout: Duration::from_secs(5),
        },
        cache: CacheConfig {
            mode,
            ttl: Duration::from_secs(300),
            check_period: Duration::from_secs(600),
            max_items: 1000,
            max_size_bytes: 64 * 1024 * 1024,
            redis_memory_threshold: 0.8,
            cassandra_max_files: 1000,
        },
        redis: RedisConfig {
            host: "127.0.0.1".into(),
            // Deliberately closed port so remote modes fail fast in tests.
            port: 1,
            password: None,
            db: 0,
            key_prefix: "vod-edge-test:".into(),
            max_retries: 0,
            connect_timeout: Duration::from_millis(200),
            command_timeout: Duration::from_millis(200),
        },
        cassandra: CassandraConfig {
            hosts: vec!["127.0.0.1:1".into()],
            keyspace: "vod_edge_test".into(),
            username: None,
            password: None,
            local_dc: None,
            consistency: "LOCAL_QUORUM".into(),
            replication_factor: 1,
            table: "content_cache".into(),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
        },
        capacity: CapacityConfig {
            redis_threshold: 85.0,
            cassandra_threshold: 90.0,
            check_interval: Duration::from_secs(60),
        },
    }
}

/// Bounded memory backend with the given byte ceiling, already
/// initialized.
pub async fn memory_backend(max_bytes: u64) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig {
        max_items: 10_000,
        max_size_bytes: max_bytes,
        default_ttl: Duration::from_secs(300),
        check_period: Duration::from_secs(600),
    }));
    backend.initialize().await.expect("memory backend init");
    backend
}

/// A backend whose store is unreachable: everything degrades the way the
/// contract requires.
pub struct DownBackend;

#[async_trait]
impl CacheBackend for DownBackend {
    async fn initialize(&self) -> Result<()> {
        anyhow::bail!("store unreachable")
    }
    async fn get(&self, _key: &str) -> Option<CacheItem> {
        None
    }
    async fn set(&self, _key: &str, _data: Bytes, _opts: SetOptions) -> bool {
        false
    }
    async fn delete(&self, _key: &str) -> bool {
        false
    }
    async fn exists(&self, _key: &str) -> bool {
        false
    }
    async fn clear(&self) -> bool {
        false
    }
    async fn stats(&self) -> CacheStats {
        CacheStats {
            backend: "down".into(),
            hits: 0,
            misses: 0,
            errors: 1,
            sets: 0,
            items: 0,
            used_bytes: 0,
            hit_ratio: 0.0,
            connected: false,
        }
    }
    async fn is_healthy(&self) -> bool {
        false
    }
    async fn close(&self) {}
    async fn capacity(&self) -> CapacityInfo {
        CapacityInfo::default()
    }
    async fn items_by_hit_count(&self, _limit: usize) -> Vec<KeyHitCount> {
        Vec::new()
    }
    async fn increment_hit_count(&self, _key: &str) -> bool {
        false
    }
    fn name(&self) -> &'static str {
        "down"
    }
}

#[derive(Clone)]
pub struct MockObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl MockObject {
    pub fn new(data: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            data: data.into(),
            content_type: Some(content_type.to_string()),
            etag: Some("\"mock-etag\"".to_string()),
            last_modified: Some(Utc::now()),
        }
    }
}

/// In-memory origin standing in for the S3 endpoint.
#[derive(Default)]
pub struct MockOrigin {
    objects: HashMap<(String, String), MockObject>,
    pub get_calls: AtomicU64,
    pub head_calls: AtomicU64,
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, bucket: &str, key: &str, object: MockObject) -> Self {
        self.objects
            .insert((bucket.to_string(), key.to_string()), object);
        self
    }

    pub fn get_call_count(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }
}

fn parse_range(range: &str, total: usize) -> Option<(usize, usize)> {
    let spec = range.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = match end {
        "" => total - 1,
        e => e.parse().ok()?,
    };
    (start <= end && end < total).then_some((start, end))
}

#[async_trait]
impl ObjectStore for MockOrigin {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let object = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| OriginError::NoSuchKey(format!("{bucket}/{key}")))?;

        let total = object.data.len();
        let (slice, content_range) = match range {
            Some(r) => {
                let (start, end) =
                    parse_range(r, total).ok_or_else(|| OriginError::Other("bad range".into()))?;
                (
                    object.data.slice(start..=end),
                    Some(format!("bytes {start}-{end}/{total}")),
                )
            }
            None => (object.data.clone(), None),
        };

        let metadata = ObjectMetadata {
            content_type: object.content_type.clone(),
            content_length: Some(slice.len() as u64),
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_range,
            accept_ranges: Some("bytes".to_string()),
        };
        // Deliver in small chunks so the tee sees a real stream.
        let chunks: Vec<std::io::Result<Bytes>> = slice
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body: BodyStream = Box::pin(stream::iter(chunks));
        Ok(FetchedObject { metadata, body })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError> {
        self.head_calls.fetch_add(1, Ordering::Relaxed);
        let object = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| OriginError::NoSuchKey(format!("{bucket}/{key}")))?;
        Ok(ObjectMetadata {
            content_type: object.content_type.clone(),
            content_length: Some(object.data.len() as u64),
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_range: None,
            accept_ranges: Some("bytes".to_string()),
        })
    }
}

/// Build a router over a memory-backed cache manager and the given mock
/// origin. Returns the router plus the handles tests poke at.
pub async fn test_app(origin: Arc<MockOrigin>) -> (axum::Router, Arc<CacheManager>) {
    let config = test_config(CacheMode::Memory);
    let cache = Arc::new(CacheManager::new(config.clone()));
    cache.init().await.expect("cache init");
    let capacity = CapacityManager::new(Arc::clone(&cache), &config.capacity);
    let state = AppState {
        config: Arc::new(config),
        cache: Arc::clone(&cache),
        capacity,
        origin,
        started_at: Instant::now(),
    };
    (router(state), cache)
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
