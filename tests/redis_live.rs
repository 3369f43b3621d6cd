//! Redis backend tests against a live instance.
//!
//! These assume a reachable Redis (default `127.0.0.1:6379`, override
//! with `REDIS_HOST`/`REDIS_PORT`) and are ignored by default:
//!
//! ```sh
//! cargo test --test redis_live -- --ignored
//! ```

mod common;

use bytes::Bytes;
use common::test_key;
use std::time::Duration;
use vod_edge::cache::{CacheBackend, RedisBackend, SetOptions};
use vod_edge::config::RedisConfig;

fn live_config() -> RedisConfig {
    RedisConfig {
        host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379),
        password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        db: 0,
        key_prefix: format!("vod-edge-test:{}:", rand::random::<u32>()),
        max_retries: 1,
        connect_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(2),
    }
}

async fn live_backend() -> RedisBackend {
    let backend = RedisBackend::new(live_config(), Duration::from_secs(60), 0.8);
    backend.initialize().await.expect("redis reachable");
    backend
}

#[tokio::test]
#[ignore]
async fn round_trips_payload_and_metadata() {
    let backend = live_backend().await;
    let key = test_key("roundtrip");

    let opts = SetOptions {
        ttl: Some(Duration::from_secs(60)),
        content_type: Some("video/mp4".into()),
        etag: Some("\"abc\"".into()),
        last_modified: Some(chrono::Utc::now()),
    };
    assert!(backend.set(&key, Bytes::from_static(b"payload"), opts).await);

    let item = backend.get(&key).await.expect("hit");
    assert_eq!(&item.data[..], b"payload");
    assert_eq!(item.size, 7);
    assert_eq!(item.content_type.as_deref(), Some("video/mp4"));
    assert_eq!(item.etag.as_deref(), Some("\"abc\""));
    assert!(item.hit_count >= 1);

    assert!(backend.delete(&key).await);
    assert!(!backend.exists(&key).await);
    backend.close().await;
}

#[tokio::test]
#[ignore]
async fn short_ttl_expires_into_a_miss() {
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
    assert!(backend.exists(&key).await);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(backend.get(&key).await.is_none());
    assert!(!backend.exists(&key).await);
    backend.close().await;
}

#[tokio::test]
#[ignore]
async fn hit_counts_rank_ascending_under_the_prefix() {
    let backend = live_backend().await;
    for i in 0..3 {
        backend
            .set(&format!("rank{i}"), Bytes::from_static(b"v"), SetOptions::default())
            .await;
    }
    backend.get("rank2").await;
    backend.get("rank2").await;
    backend.get("rank1").await;
    // The stored counters catch up out of band.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ranked = backend.items_by_hit_count(10).await;
    assert_eq!(ranked.len(), 3);
    let counts: Vec<u64> = ranked.iter().map(|e| e.hit_count).collect();
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ranked[0].key, "rank0");

    assert!(backend.clear().await);
    assert_eq!(backend.items_by_hit_count(10).await.len(), 0);
    backend.close().await;
}

#[tokio::test]
#[ignore]
async fn clear_only_touches_scoped_keys() {
    let backend_a = live_backend().await;
    let backend_b = live_backend().await;

    backend_a
        .set("mine", Bytes::from_static(b"a"), SetOptions::default())
        .await;
    backend_b
        .set("theirs", Bytes::from_static(b"b"), SetOptions::default())
        .await;

    assert!(backend_a.clear().await);
    assert!(!backend_a.exists("mine").await);
    // The other tenant's prefix is untouched.
    assert!(backend_b.exists("theirs").await);

    backend_b.clear().await;
    backend_a.close().await;
    backend_b.close().await;
}
