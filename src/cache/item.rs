//! Cache data model: items, set options, stats and capacity snapshots,
//! and the canonical cache key.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// A single cached object.
///
/// Items are immutable once stored except for `hit_count`, which every
/// successful get bumps. `size` always equals `data.len()` and is the
/// authoritative figure for capacity accounting.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub data: Bytes,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheItem {
    /// Build a fresh item from payload bytes and set options.
    pub fn new(data: Bytes, ttl: Duration, opts: &SetOptions) -> Self {
        let now = Utc::now();
        let size = data.len() as u64;
        Self {
            data,
            size,
            content_type: opts.content_type.clone(),
            etag: opts.etag.clone(),
            last_modified: opts.last_modified,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0)),
            hit_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds until expiry, clamped to at least one. Used when promoting
    /// between tiers so the copy never outlives the source.
    pub fn remaining_ttl(&self) -> Duration {
        let secs = (self.expires_at - Utc::now()).num_seconds().max(1);
        Duration::from_secs(secs as u64)
    }
}

/// Optional metadata carried by a Set. A missing `ttl` means the backend
/// default applies.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Carry over the descriptive metadata of an existing item, preserving
    /// its remaining lifetime. Used by tier migration and promotion.
    pub fn from_item(item: &CacheItem) -> Self {
        Self {
            ttl: Some(item.remaining_ttl()),
            content_type: item.content_type.clone(),
            etag: item.etag.clone(),
            last_modified: item.last_modified,
        }
    }
}

/// Operation counters and occupancy snapshot for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub sets: u64,
    pub items: u64,
    pub used_bytes: u64,
    /// `hits / (hits + misses)`, `0.00` with no samples.
    pub hit_ratio: f64,
    pub connected: bool,
}

impl CacheStats {
    pub fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Occupancy as seen by the capacity watchdog. Exact for the memory
/// backend, store-derived (and possibly approximate) for remote tiers.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CapacityInfo {
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// 0-100; zero when the ceiling is unknown.
    pub used_percentage: f64,
    pub item_count: u64,
    pub max_items: u64,
}

impl CapacityInfo {
    pub fn percentage(used: u64, max: u64) -> f64 {
        if max == 0 {
            0.0
        } else {
            used as f64 / max as f64 * 100.0
        }
    }
}

/// Selection unit for capacity decisions: a key with its hit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHitCount {
    pub key: String,
    pub hit_count: u64,
}

/// Canonical cache key for `(bucket, key, range)`.
///
/// The projection of request headers currently admits only `Range`;
/// `Accept` and `Accept-Encoding` are recognized but do not vary responses,
/// so they contribute nothing. Two requests map to the same key exactly
/// when their `(bucket, key, range)` triple matches.
pub fn cache_key(bucket: &str, key: &str, range: Option<&str>) -> String {
    match range {
        Some(r) if !r.is_empty() => format!("{bucket}/{key}#range={r}"),
        _ => format!("{bucket}/{key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_varies_only_on_triple() {
        assert_eq!(cache_key("vod", "a/b.mp4", None), "vod/a/b.mp4");
        assert_eq!(
            cache_key("vod", "a/b.mp4", Some("bytes=0-1023")),
            "vod/a/b.mp4#range=bytes=0-1023"
        );
        assert_eq!(cache_key("vod", "a/b.mp4", Some("")), "vod/a/b.mp4");
        assert_ne!(
            cache_key("vod", "a/b.mp4", Some("bytes=0-1")),
            cache_key("vod", "a/b.mp4", Some("bytes=0-2"))
        );
    }

    #[test]
    fn item_tracks_size_and_expiry() {
        let item = CacheItem::new(
            Bytes::from_static(b"hello"),
            Duration::from_secs(60),
            &SetOptions::default(),
        );
        assert_eq!(item.size, 5);
        assert!(!item.is_expired());
        let remaining = item.remaining_ttl();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining >= Duration::from_secs(58));
    }

    #[test]
    fn expired_item_reports_expired() {
        let mut item = CacheItem::new(
            Bytes::from_static(b"x"),
            Duration::from_secs(60),
            &SetOptions::default(),
        );
        item.expires_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(item.is_expired());
        // Remaining TTL clamps to one second even past expiry.
        assert_eq!(item.remaining_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn hit_ratio_handles_no_samples() {
        assert_eq!(CacheStats::ratio(0, 0), 0.0);
        assert_eq!(CacheStats::ratio(3, 1), 0.75);
    }
}
