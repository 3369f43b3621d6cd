//! vod-edge
//!
//! An edge CDN proxy that fronts an S3-compatible object store holding
//! VOD assets. Clients fetch media objects (HLS playlists, MPEG-TS
//! segments, MP4 containers, WebVTT tracks, images) through the proxy,
//! which serves them with correct HTTP semantics and accelerates repeat
//! reads with a multi-tier content cache:
//!
//! - **memory**: bounded in-process store
//! - **redis**: fast remote key-value tier (L1)
//! - **cassandra**: persistent wide-column tier (L2)
//! - **redis-cassandra**: hybrid L1+L2 with read-through, write-both and
//!   automatic L2-to-L1 promotion
//!
//! A capacity watchdog migrates cold items L1→L2 under memory pressure
//! and evicts by least use out of L2. HLS playlists are rewritten on the
//! fly so every reference resolves through this edge.
//!
//! # Request flow
//!
//! ```text
//! GET /cdn/<bucket?>/<key>
//!   → cache lookup ── hit ──→ respond (X-Cache: HIT)
//!   → miss → origin GetObject
//!       → M3U8: buffer, rewrite, respond, cache if small
//!       → else: stream to client, tee into cache when unranged and small
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod origin;
pub mod playlist;
pub mod serve;

pub use cache::{CacheBackend, CacheManager, CapacityManager};
pub use config::{CacheMode, Config};
pub use error::ProxyError;
