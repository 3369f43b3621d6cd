//! Redis cache backend, the fast L1 tier.
//!
//! Each item is a Redis hash with the payload base64-encoded at rest and
//! a native TTL equal to the item TTL. All keys carry a fixed prefix so
//! `clear` and enumeration never touch other tenants on the same store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};
use crate::config::RedisConfig;

const FIELD_DATA: &str = "data";
const FIELD_SIZE: &str = "size";
const FIELD_CONTENT_TYPE: &str = "contentType";
const FIELD_ETAG: &str = "etag";
const FIELD_LAST_MODIFIED: &str = "lastModified";
const FIELD_CREATED_AT: &str = "createdAt";
const FIELD_EXPIRES_AT: &str = "expiresAt";
const FIELD_HIT_COUNT: &str = "hitCount";

pub struct RedisBackend {
    config: RedisConfig,
    default_ttl: Duration,
    /// Fraction of the server's `maxmemory` this cache may occupy.
    memory_threshold: f64,
    conn: RwLock<Option<ConnectionManager>>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    connected: AtomicBool,
}

impl RedisBackend {
    pub fn new(config: RedisConfig, default_ttl: Duration, memory_threshold: f64) -> Self {
        Self {
            config,
            default_ttl,
            memory_threshold,
            conn: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn unscoped(&self, stored: &str) -> String {
        stored
            .strip_prefix(&self.config.key_prefix)
            .unwrap_or(stored)
            .to_string()
    }

    async fn manager(&self) -> Option<ConnectionManager> {
        self.conn.read().await.clone()
    }

    fn record_error(&self, op: &str, err: &redis::RedisError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(op = op, error = %err, "[redis] command failed");
    }

    /// SCAN every key under this node's prefix.
    async fn scan_prefix(&self) -> Result<Vec<String>> {
        let mut conn = self.manager().await.context("redis not connected")?;
        let pattern = format!("{}*", self.config.key_prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            cursor = next;
            keys.extend(batch);
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Pull `used_memory` and `maxmemory` out of `INFO memory`.
    async fn memory_info(&self) -> Result<(u64, u64)> {
        let mut conn = self.manager().await.context("redis not connected")?;
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;
        let mut used = 0u64;
        let mut max = 0u64;
        for line in info.lines() {
            if let Some(v) = line.strip_prefix("used_memory:") {
                used = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("maxmemory:") {
                max = v.trim().parse().unwrap_or(0);
            }
        }
        Ok((used, max))
    }

    fn item_from_fields(fields: &HashMap<String, String>) -> Option<CacheItem> {
        let data = BASE64.decode(fields.get(FIELD_DATA)?).ok()?;
        let size = fields
            .get(FIELD_SIZE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(data.len() as u64);
        let parse_ts = |name: &str| -> Option<DateTime<Utc>> {
            fields
                .get(name)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        Some(CacheItem {
            data: Bytes::from(data),
            size,
            content_type: fields.get(FIELD_CONTENT_TYPE).cloned(),
            etag: fields.get(FIELD_ETAG).cloned(),
            last_modified: parse_ts(FIELD_LAST_MODIFIED),
            created_at: parse_ts(FIELD_CREATED_AT).unwrap_or_else(Utc::now),
            expires_at: parse_ts(FIELD_EXPIRES_AT).unwrap_or_else(Utc::now),
            hit_count: fields
                .get(FIELD_HIT_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }

    /// Fire-and-forget delete, used when a get observes an expired item.
    fn schedule_delete(&self, scoped_key: String) {
        if let Some(mut conn) = self.conn.try_read().ok().and_then(|g| g.clone()) {
            tokio::spawn(async move {
                let _: std::result::Result<(), _> = conn.del(&scoped_key).await;
            });
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn initialize(&self) -> Result<()> {
        let url = self.config.url();
        info!(host = %self.config.host, port = self.config.port, "initializing redis cache backend");

        let client = Client::open(url.as_str())
            .with_context(|| format!("failed to create redis client for {url}"))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Some(self.config.connect_timeout))
            .set_response_timeout(Some(self.config.command_timeout))
            .set_number_of_retries(self.config.max_retries as usize);

        let manager = ConnectionManager::new_with_config(client, manager_config)
            .await
            .context("failed to establish redis connection manager")?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING health check failed")?;

        *self.conn.write().await = Some(manager);
        self.connected.store(true, Ordering::Relaxed);
        info!("redis cache backend connected");
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let Some(mut conn) = self.manager().await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let scoped = self.scoped(key);

        let fields: HashMap<String, String> = match conn.hgetall(&scoped).await {
            Ok(f) => f,
            Err(e) => {
                self.record_error("get", &e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if fields.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut item = match Self::item_from_fields(&fields) {
            Some(item) => item,
            None => {
                // Undecodable entry: treat as corrupt, drop it.
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.schedule_delete(scoped);
                return None;
            }
        };

        if item.is_expired() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.schedule_delete(scoped);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        item.hit_count += 1;
        // The stored count catches up out of band.
        let mut bump_conn = conn.clone();
        tokio::spawn(async move {
            let _: std::result::Result<i64, _> =
                bump_conn.hincr(&scoped, FIELD_HIT_COUNT, 1i64).await;
        });
        Some(item)
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let Some(mut conn) = self.manager().await else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        let item = CacheItem::new(data, ttl, &opts);
        let scoped = self.scoped(key);

        let mut fields: Vec<(&str, String)> = vec![
            (FIELD_DATA, BASE64.encode(&item.data)),
            (FIELD_SIZE, item.size.to_string()),
            (FIELD_CREATED_AT, item.created_at.to_rfc3339()),
            (FIELD_EXPIRES_AT, item.expires_at.to_rfc3339()),
            (FIELD_HIT_COUNT, item.hit_count.to_string()),
        ];
        if let Some(ct) = &item.content_type {
            fields.push((FIELD_CONTENT_TYPE, ct.clone()));
        }
        if let Some(etag) = &item.etag {
            fields.push((FIELD_ETAG, etag.clone()));
        }
        if let Some(lm) = &item.last_modified {
            fields.push((FIELD_LAST_MODIFIED, lm.to_rfc3339()));
        }

        // DEL first so a replacement cannot inherit stale fields.
        let result: std::result::Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .del(&scoped)
            .ignore()
            .hset_multiple(&scoped, &fields)
            .ignore()
            .expire(&scoped, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = ttl.as_secs(), "[redis] cached item");
                true
            }
            Err(e) => {
                self.record_error("set", &e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        match conn.del::<_, i64>(self.scoped(key)).await {
            Ok(count) => count > 0,
            Err(e) => {
                self.record_error("delete", &e);
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        let scoped = self.scoped(key);
        let expires: Option<String> = match conn.hget(&scoped, FIELD_EXPIRES_AT).await {
            Ok(v) => v,
            Err(e) => {
                self.record_error("exists", &e);
                return false;
            }
        };
        match expires.and_then(|v| DateTime::parse_from_rfc3339(&v).ok()) {
            Some(expires_at) if Utc::now() <= expires_at => true,
            Some(_) => {
                self.schedule_delete(scoped);
                false
            }
            None => false,
        }
    }

    async fn clear(&self) -> bool {
        let keys = match self.scan_prefix().await {
            Ok(keys) => keys,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "[redis] clear failed to enumerate keys");
                return false;
            }
        };
        if keys.is_empty() {
            return true;
        }
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        match conn.del::<_, i64>(&keys).await {
            Ok(count) => {
                debug!(count = count, "[redis] cleared scoped keys");
                true
            }
            Err(e) => {
                self.record_error("clear", &e);
                false
            }
        }
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let items = self.scan_prefix().await.map(|k| k.len() as u64).unwrap_or(0);
        let used_bytes = self.memory_info().await.map(|(used, _)| used).unwrap_or(0);
        CacheStats {
            backend: self.name().to_string(),
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            items,
            used_bytes,
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }

    async fn is_healthy(&self) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        let pong: std::result::Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn close(&self) {
        *self.conn.write().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn capacity(&self) -> CapacityInfo {
        let (used, maxmemory) = self.memory_info().await.unwrap_or((0, 0));
        let max_bytes = (maxmemory as f64 * self.memory_threshold) as u64;
        let item_count = self.scan_prefix().await.map(|k| k.len() as u64).unwrap_or(0);
        CapacityInfo {
            used_bytes: used,
            max_bytes,
            used_percentage: CapacityInfo::percentage(used, max_bytes),
            item_count,
            max_items: 0,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount> {
        let keys = match self.scan_prefix().await {
            Ok(keys) => keys,
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };
        let Some(mut conn) = self.manager().await else {
            return Vec::new();
        };

        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(100) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.hget(key, FIELD_HIT_COUNT);
            }
            let counts: Vec<Option<u64>> = match pipe.query_async(&mut conn).await {
                Ok(counts) => counts,
                Err(e) => {
                    self.record_error("items_by_hit_count", &e);
                    continue;
                }
            };
            for (key, count) in chunk.iter().zip(counts) {
                entries.push(KeyHitCount {
                    key: self.unscoped(key),
                    hit_count: count.unwrap_or(0),
                });
            }
        }
        entries.sort_by_key(|e| e.hit_count);
        entries.truncate(limit);
        entries
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        let Some(mut conn) = self.manager().await else {
            return false;
        };
        let scoped = self.scoped(key);
        let present: bool = match conn.exists(&scoped).await {
            Ok(v) => v,
            Err(e) => {
                self.record_error("increment_hit_count", &e);
                return false;
            }
        };
        if !present {
            return false;
        }
        match conn.hincr::<_, _, _, i64>(&scoped, FIELD_HIT_COUNT, 1i64).await {
            Ok(_) => true,
            Err(e) => {
                self.record_error("increment_hit_count", &e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
