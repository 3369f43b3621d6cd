//! Cassandra backend tests against a live instance.
//!
//! These assume a reachable Cassandra/ScyllaDB node (default
//! `127.0.0.1:9042`, override with `CASSANDRA_HOSTS`) and are ignored by
//! default:
//!
//! ```sh
//! cargo test --test cassandra_live -- --ignored
//! ```

mod common;

use bytes::Bytes;
use common::test_key;
use std::time::Duration;
use vod_edge::cache::{CacheBackend, CassandraBackend, SetOptions};
use vod_edge::config::CassandraConfig;

fn live_config() -> CassandraConfig {
    CassandraConfig {
        hosts: std::env::var("CASSANDRA_HOSTS")
            .unwrap_or_else(|_| "127.0.0.1:9042".into())
            .split(',')
            .map(str::to_string)
            .collect(),
        keyspace: "vod_edge_test".into(),
        username: None,
        password: None,
        local_dc: None,
        consistency: "LOCAL_QUORUM".into(),
        replication_factor: 1,
        table: format!("cache_{}", rand::random::<u16>()),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    }
}

async fn live_backend() -> CassandraBackend {
    let backend = CassandraBackend::new(live_config(), Duration::from_secs(60), 1000);
    backend.initialize().await.expect("cassandra reachable");
    backend
}

#[tokio::test]
#[ignore]
async fn bootstraps_schema_and_round_trips() {
    let backend = live_backend().await;
    let key = test_key("roundtrip");

    let opts = SetOptions {
        ttl: Some(Duration::from_secs(120)),
        content_type: Some("video/mp2t".into()),
        etag: Some("\"seg\"".into()),
        last_modified: Some(chrono::Utc::now()),
    };
    assert!(backend.set(&key, Bytes::from_static(b"segment-bytes"), opts).await);

    let item = backend.get(&key).await.expect("hit");
    assert_eq!(&item.data[..], b"segment-bytes");
    assert_eq!(item.size, 13);
    assert_eq!(item.content_type.as_deref(), Some("video/mp2t"));
    assert!(item.hit_count >= 1);

    assert!(backend.exists(&key).await);
    assert!(backend.delete(&key).await);
    assert!(!backend.exists(&key).await);
    backend.close().await;
}

#[tokio::test]
#[ignore]
async fn native_ttl_expires_rows() {
    let backend = live_backend().await;
    let key = test_key("ttl");

    assert!(
        backend
            .set(
                &key,
                Bytes::from_static(b"v"),
                SetOptions::with_ttl(Duration::from_secs(1)),
            )
            .await
    );
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(backend.get(&key).await.is_none());
    assert!(!backend.exists(&key).await);
    backend.close().await;
}

#[tokio::test]
#[ignore]
async fn counter_table_ranks_items_ascending() {
    let backend = live_backend().await;
    for i in 0..3 {
        backend
            .set(&format!("rank{i}"), Bytes::from_static(b"v"), SetOptions::default())
            .await;
    }
    backend.get("rank2").await;
    backend.get("rank2").await;
    backend.increment_hit_count("rank1").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ranked = backend.items_by_hit_count(10).await;
    assert_eq!(ranked.len(), 3);
    let counts: Vec<u64> = ranked.iter().map(|e| e.hit_count).collect();
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ranked[0].key, "rank0");

    // A replacement Set restarts the key's count at zero.
    backend
        .set("rank2", Bytes::from_static(b"v2"), SetOptions::default())
        .await;
    let ranked = backend.items_by_hit_count(10).await;
    let rank2 = ranked.iter().find(|e| e.key == "rank2").expect("rank2 present");
    assert_eq!(rank2.hit_count, 0);

    let stats = backend.stats().await;
    assert_eq!(stats.items, 3);
    assert!(stats.used_bytes >= 3);

    assert!(backend.clear().await);
    assert_eq!(backend.stats().await.items, 0);
    backend.close().await;
}
