//! Cassandra cache backend, the persistent L2 tier.
//!
//! Initialization bootstraps the keyspace, the item table (leveled
//! compaction, short GC grace, secondary index on `expires_at`) and a
//! sibling counter table for hit counts. Rows expire natively via
//! `USING TTL`; `expires_at` is also materialized for filtered reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use scylla::frame::value::{Counter, CqlTimestamp};
use scylla::prepared_statement::PreparedStatement;
use scylla::query::Query;
use scylla::statement::Consistency;
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::item::{CacheItem, CacheStats, CapacityInfo, KeyHitCount, SetOptions};
use crate::config::CassandraConfig;

type ItemRow = (
    Vec<u8>,
    i64,
    Option<String>,
    Option<String>,
    Option<CqlTimestamp>,
    CqlTimestamp,
    CqlTimestamp,
);

struct Statements {
    session: Session,
    insert: PreparedStatement,
    select: PreparedStatement,
    select_expiry: PreparedStatement,
    delete_item: PreparedStatement,
    delete_hits: PreparedStatement,
    hit_add: PreparedStatement,
    hit_get: PreparedStatement,
}

pub struct CassandraBackend {
    config: CassandraConfig,
    default_ttl: Duration,
    /// Row-count ceiling used for capacity percentage.
    max_items: u64,
    conn: RwLock<Option<Arc<Statements>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    sets: AtomicU64,
    connected: AtomicBool,
}

fn parse_consistency(name: &str) -> Consistency {
    match name.trim().to_ascii_uppercase().as_str() {
        "ONE" => Consistency::One,
        "TWO" => Consistency::Two,
        "THREE" => Consistency::Three,
        "QUORUM" => Consistency::Quorum,
        "ALL" => Consistency::All,
        "LOCAL_ONE" => Consistency::LocalOne,
        "EACH_QUORUM" => Consistency::EachQuorum,
        _ => Consistency::LocalQuorum,
    }
}

fn ts(dt: DateTime<Utc>) -> CqlTimestamp {
    CqlTimestamp(dt.timestamp_millis())
}

fn from_ts(ts: CqlTimestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.0).single().unwrap_or_else(Utc::now)
}

impl CassandraBackend {
    pub fn new(config: CassandraConfig, default_ttl: Duration, max_items: u64) -> Self {
        Self {
            config,
            default_ttl,
            max_items,
            conn: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    fn table(&self) -> String {
        format!("{}.{}", self.config.keyspace, self.config.table)
    }

    fn hits_table(&self) -> String {
        format!("{}.{}", self.config.keyspace, self.config.hits_table())
    }

    async fn statements(&self) -> Option<Arc<Statements>> {
        self.conn.read().await.clone()
    }

    fn record_error(&self, op: &str, err: &dyn std::fmt::Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(op = op, error = %err, "[cassandra] query failed");
    }

    async fn bootstrap_schema(&self, session: &Session) -> Result<()> {
        let keyspace = &self.config.keyspace;
        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    self.config.replication_factor
                ),
                (),
            )
            .await
            .context("failed to create keyspace")?;

        session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     cache_key text PRIMARY KEY, \
                     data blob, \
                     size bigint, \
                     content_type text, \
                     etag text, \
                     last_modified timestamp, \
                     created_at timestamp, \
                     expires_at timestamp) \
                     WITH compaction = {{'class': 'LeveledCompactionStrategy'}} \
                     AND gc_grace_seconds = 3600",
                    self.table()
                ),
                (),
            )
            .await
            .context("failed to create cache table")?;

        session
            .query_unpaged(
                format!(
                    "CREATE INDEX IF NOT EXISTS {}_expires_idx ON {} (expires_at)",
                    self.config.table,
                    self.table()
                ),
                (),
            )
            .await
            .context("failed to create expiry index")?;

        session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (cache_key text PRIMARY KEY, hits counter)",
                    self.hits_table()
                ),
                (),
            )
            .await
            .context("failed to create hit counter table")?;

        session.await_schema_agreement().await.context("schema agreement")?;
        Ok(())
    }

    /// One unprepared statement at LOCAL_ONE for stats/scan work.
    fn scan_query(&self, cql: String) -> Query {
        let mut query = Query::new(cql);
        query.set_consistency(Consistency::LocalOne);
        query
    }

    async fn scan_hit_counts(&self, stmts: &Statements) -> Result<HashMap<String, u64>> {
        let query = self.scan_query(format!("SELECT cache_key, hits FROM {}", self.hits_table()));
        let mut rows = stmts
            .session
            .query_iter(query, ())
            .await?
            .into_typed::<(String, Counter)>();
        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await {
            let (key, Counter(hits)) = row?;
            counts.insert(key, hits.max(0) as u64);
        }
        Ok(counts)
    }

    async fn count_rows(&self, stmts: &Statements) -> Result<u64> {
        let query = self.scan_query(format!("SELECT COUNT(*) FROM {}", self.table()));
        let result = stmts.session.query_unpaged(query, ()).await?;
        let (count,) = result.single_row_typed::<(i64,)>()?;
        Ok(count.max(0) as u64)
    }

    async fn sum_bytes(&self, stmts: &Statements) -> Result<u64> {
        let query = self.scan_query(format!("SELECT SUM(size) FROM {}", self.table()));
        let result = stmts.session.query_unpaged(query, ()).await?;
        let (sum,) = result.single_row_typed::<(Option<i64>,)>()?;
        Ok(sum.unwrap_or(0).max(0) as u64)
    }

    fn schedule_delete(&self, key: String) {
        let conn = self.conn.try_read().ok().and_then(|g| g.clone());
        if let Some(stmts) = conn {
            tokio::spawn(async move {
                let _ = stmts.session.execute_unpaged(&stmts.delete_item, (&key,)).await;
                let _ = stmts.session.execute_unpaged(&stmts.delete_hits, (&key,)).await;
            });
        }
    }
}

#[async_trait]
impl CacheBackend for CassandraBackend {
    async fn initialize(&self) -> Result<()> {
        info!(hosts = ?self.config.hosts, keyspace = %self.config.keyspace,
            "initializing cassandra cache backend");

        let profile = ExecutionProfile::builder()
            .consistency(parse_consistency(&self.config.consistency))
            .request_timeout(Some(self.config.request_timeout))
            .build();

        let mut builder = SessionBuilder::new()
            .known_nodes(&self.config.hosts)
            .connection_timeout(self.config.connect_timeout)
            .default_execution_profile_handle(profile.into_handle());
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.user(user, pass);
        }

        let session = builder.build().await.context("failed to connect to cassandra")?;
        self.bootstrap_schema(&session).await?;

        let table = self.table();
        let hits_table = self.hits_table();
        let insert = session
            .prepare(format!(
                "INSERT INTO {table} (cache_key, data, size, content_type, etag, \
                 last_modified, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) USING TTL ?"
            ))
            .await?;
        let select = session
            .prepare(format!(
                "SELECT data, size, content_type, etag, last_modified, created_at, \
                 expires_at FROM {table} WHERE cache_key = ?"
            ))
            .await?;
        let select_expiry = session
            .prepare(format!("SELECT expires_at FROM {table} WHERE cache_key = ?"))
            .await?;
        let delete_item = session
            .prepare(format!("DELETE FROM {table} WHERE cache_key = ?"))
            .await?;
        let delete_hits = session
            .prepare(format!("DELETE FROM {hits_table} WHERE cache_key = ?"))
            .await?;
        let hit_add = session
            .prepare(format!(
                "UPDATE {hits_table} SET hits = hits + ? WHERE cache_key = ?"
            ))
            .await?;
        let hit_get = session
            .prepare(format!("SELECT hits FROM {hits_table} WHERE cache_key = ?"))
            .await?;

        *self.conn.write().await = Some(Arc::new(Statements {
            session,
            insert,
            select,
            select_expiry,
            delete_item,
            delete_hits,
            hit_add,
            hit_get,
        }));
        self.connected.store(true, Ordering::Relaxed);
        info!(table = %self.table(), "cassandra cache backend ready");
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let Some(stmts) = self.statements().await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let result = match stmts.session.execute_unpaged(&stmts.select, (key,)).await {
            Ok(result) => result,
            Err(e) => {
                self.record_error("get", &e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let row = match result.maybe_first_row_typed::<ItemRow>() {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.record_error("get", &e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let (data, size, content_type, etag, last_modified, created_at, expires_at) = row;
        let expires_at = from_ts(expires_at);
        if Utc::now() > expires_at {
            // Native TTL lags behind the materialized expiry; reconcile.
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.schedule_delete(key.to_string());
            return None;
        }

        let hit_count = match stmts.session.execute_unpaged(&stmts.hit_get, (key,)).await {
            Ok(result) => result
                .maybe_first_row_typed::<(Counter,)>()
                .ok()
                .flatten()
                .map(|(Counter(h),)| h.max(0) as u64)
                .unwrap_or(0),
            Err(_) => 0,
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        let bump_key = key.to_string();
        let bump = Arc::clone(&stmts);
        tokio::spawn(async move {
            let _ = bump.session.execute_unpaged(&bump.hit_add, (1i64, &bump_key)).await;
        });

        Some(CacheItem {
            data: Bytes::from(data),
            size: size.max(0) as u64,
            content_type,
            etag,
            last_modified: last_modified.map(from_ts),
            created_at: from_ts(created_at),
            expires_at,
            hit_count: hit_count + 1,
        })
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let Some(stmts) = self.statements().await else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        let item = CacheItem::new(data, ttl, &opts);
        let ttl_secs = ttl.as_secs().max(1).min(i32::MAX as u64) as i32;

        // A Set replaces the whole record; counter rows carry no TTL, so
        // the key's hit count is dropped here or it would survive both
        // replacement and native row expiry.
        if let Err(e) = stmts.session.execute_unpaged(&stmts.delete_hits, (key,)).await {
            self.record_error("set", &e);
        }

        let values = (
            key,
            item.data.as_ref(),
            item.size as i64,
            item.content_type.as_deref(),
            item.etag.as_deref(),
            item.last_modified.map(ts),
            ts(item.created_at),
            ts(item.expires_at),
            ttl_secs,
        );
        match stmts.session.execute_unpaged(&stmts.insert, values).await {
            Ok(_) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = ttl_secs, "[cassandra] cached item");
                true
            }
            Err(e) => {
                self.record_error("set", &e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(stmts) = self.statements().await else {
            return false;
        };
        // CQL deletes are tombstones either way; report presence-based
        // success from a cheap existence probe.
        let existed = self.exists(key).await;
        let deleted = stmts.session.execute_unpaged(&stmts.delete_item, (key,)).await;
        let _ = stmts.session.execute_unpaged(&stmts.delete_hits, (key,)).await;
        match deleted {
            Ok(_) => existed,
            Err(e) => {
                self.record_error("delete", &e);
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(stmts) = self.statements().await else {
            return false;
        };
        match stmts.session.execute_unpaged(&stmts.select_expiry, (key,)).await {
            Ok(result) => match result.maybe_first_row_typed::<(CqlTimestamp,)>() {
                Ok(Some((expires_at,))) => Utc::now() <= from_ts(expires_at),
                _ => false,
            },
            Err(e) => {
                self.record_error("exists", &e);
                false
            }
        }
    }

    async fn clear(&self) -> bool {
        let Some(stmts) = self.statements().await else {
            return false;
        };
        let truncate_items = stmts
            .session
            .query_unpaged(format!("TRUNCATE {}", self.table()), ())
            .await;
        let truncate_hits = stmts
            .session
            .query_unpaged(format!("TRUNCATE {}", self.hits_table()), ())
            .await;
        match (truncate_items, truncate_hits) {
            (Ok(_), Ok(_)) => true,
            (items, hits) => {
                if let Err(e) = items {
                    self.record_error("clear", &e);
                }
                if let Err(e) = hits {
                    self.record_error("clear", &e);
                }
                false
            }
        }
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let (items, used_bytes) = match self.statements().await {
            Some(stmts) => (
                self.count_rows(&stmts).await.unwrap_or(0),
                self.sum_bytes(&stmts).await.unwrap_or(0),
            ),
            None => (0, 0),
        };
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
        let Some(stmts) = self.statements().await else {
            return false;
        };
        stmts
            .session
            .query_unpaged("SELECT release_version FROM system.local", ())
            .await
            .is_ok()
    }

    async fn close(&self) {
        *self.conn.write().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn capacity(&self) -> CapacityInfo {
        let Some(stmts) = self.statements().await else {
            return CapacityInfo::default();
        };
        let item_count = match self.count_rows(&stmts).await {
            Ok(count) => count,
            Err(e) => {
                self.record_error("capacity", &e);
                0
            }
        };
        let used_bytes = self.sum_bytes(&stmts).await.unwrap_or(0);
        CapacityInfo {
            used_bytes,
            max_bytes: 0,
            used_percentage: CapacityInfo::percentage(item_count, self.max_items),
            item_count,
            max_items: self.max_items,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<KeyHitCount> {
        let Some(stmts) = self.statements().await else {
            return Vec::new();
        };
        let counts = match self.scan_hit_counts(&stmts).await {
            Ok(counts) => counts,
            Err(e) => {
                self.record_error("items_by_hit_count", &e);
                HashMap::new()
            }
        };

        let query = self.scan_query(format!("SELECT cache_key FROM {}", self.table()));
        let mut rows = match stmts.session.query_iter(query, ()).await {
            Ok(rows) => rows.into_typed::<(String,)>(),
            Err(e) => {
                self.record_error("items_by_hit_count", &e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await {
            match row {
                Ok((key,)) => {
                    let hit_count = counts.get(&key).copied().unwrap_or(0);
                    entries.push(KeyHitCount { key, hit_count });
                }
                Err(e) => {
                    self.record_error("items_by_hit_count", &e);
                    break;
                }
            }
        }
        entries.sort_by_key(|e| e.hit_count);
        entries.truncate(limit);
        entries
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        let Some(stmts) = self.statements().await else {
            return false;
        };
        if !self.exists(key).await {
            return false;
        }
        match stmts.session.execute_unpaged(&stmts.hit_add, (1i64, key)).await {
            Ok(_) => true,
            Err(e) => {
                self.record_error("increment_hit_count", &e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "cassandra"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_names_parse() {
        assert_eq!(parse_consistency("LOCAL_ONE"), Consistency::LocalOne);
        assert_eq!(parse_consistency("local_quorum"), Consistency::LocalQuorum);
        assert_eq!(parse_consistency("QUORUM"), Consistency::Quorum);
        // Unknown names fall back to LOCAL_QUORUM.
        assert_eq!(parse_consistency("whatever"), Consistency::LocalQuorum);
    }

    #[test]
    fn timestamps_round_trip_through_cql_millis() {
        let now = Utc::now();
        let restored = from_ts(ts(now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
