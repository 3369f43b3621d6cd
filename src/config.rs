//! Environment-driven configuration.
//!
//! Every tunable is an environment variable with a default, assembled once
//! at startup into a typed [`Config`]. Nothing here touches the network;
//! connection failures surface later, when the cache manager initializes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Selected cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Memory,
    Redis,
    Cassandra,
    /// Hybrid: Redis as L1, Cassandra as L2.
    RedisCassandra,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Cassandra => "cassandra",
            Self::RedisCassandra => "redis-cassandra",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "cassandra" => Ok(Self::Cassandra),
            "redis-cassandra" | "hybrid" => Ok(Self::RedisCassandra),
            other => Err(format!("unknown cache mode '{other}'")),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub log_level: String,
    /// First path segment under which objects are served (no slashes).
    pub cdn_base_path: String,
    /// First path segment of the admin surface (no slashes).
    pub proxy_base_path: String,
}

/// Upstream S3-compatible object store.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    /// Bucket used when the request path does not name one.
    pub default_bucket: String,
    pub force_path_style: bool,
    pub use_ssl: bool,
    pub request_timeout: Duration,
}

/// Cache engine settings shared by all backends.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub mode: CacheMode,
    /// Default item TTL when a Set carries none.
    pub ttl: Duration,
    /// Memory backend expiry-sweep period.
    pub check_period: Duration,
    pub max_items: u64,
    pub max_size_bytes: u64,
    /// Fraction (0-1) of Redis `maxmemory` the cache may occupy.
    pub redis_memory_threshold: f64,
    /// Row-count ceiling for the Cassandra tier.
    pub cassandra_max_files: u64,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Every key this node writes is scoped under this prefix.
    pub key_prefix: String,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl RedisConfig {
    /// Connection URL in the form the `redis` crate accepts.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CassandraConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub local_dc: Option<String>,
    /// Consistency for item reads/writes; stats scans always use LOCAL_ONE.
    pub consistency: String,
    pub replication_factor: u32,
    pub table: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl CassandraConfig {
    /// Name of the sibling counter table tracking per-item hit counts.
    pub fn hits_table(&self) -> String {
        format!("{}_hits", self.table)
    }
}

/// Capacity watchdog tunables. Thresholds are percentages in (0, 100).
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    pub redis_threshold: f64,
    pub cassandra_threshold: f64,
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
    pub redis: RedisConfig,
    pub cassandra: CassandraConfig,
    pub capacity: CapacityConfig,
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

impl Config {
    /// Assemble the full configuration from the process environment.
    pub fn from_env() -> Self {
        let mode = env_str("CACHE_MODE", "memory")
            .parse()
            .unwrap_or(CacheMode::Memory);

        Self {
            server: ServerConfig {
                host: env_str("HOST", "0.0.0.0"),
                port: env_parse("PORT", 8080),
                environment: env_str("NODE_ENV", "development"),
                log_level: env_str("LOG_LEVEL", "info"),
                cdn_base_path: env_str("CDN_BASE_PATH", "cdn"),
                proxy_base_path: env_str("PROXY_BASE_PATH", "proxy"),
            },
            origin: OriginConfig {
                endpoint: env_str("S3_ENDPOINT", "http://127.0.0.1:9000"),
                access_key_id: env_str("S3_ACCESS_KEY_ID", "minioadmin"),
                secret_access_key: env_str("S3_SECRET_ACCESS_KEY", "minioadmin"),
                region: env_str("S3_REGION", "us-east-1"),
                default_bucket: env_str("S3_BUCKET_NAME", "vod"),
                force_path_style: env_bool("S3_FORCE_PATH_STYLE", true),
                use_ssl: env_bool("S3_USE_SSL", false),
                request_timeout: env_secs("REQUEST_TIMEOUT", 30),
            },
            cache: CacheConfig {
                mode,
                ttl: env_secs("CACHE_TTL", 3600),
                check_period: env_secs("CACHE_CHECK_PERIOD", 600),
                max_items: env_parse("CACHE_MAX_ITEMS", 1000),
                max_size_bytes: env_parse("CACHE_MAX_SIZE", 104_857_600),
                redis_memory_threshold: env_parse("REDIS_MEMORY_THRESHOLD", 0.8),
                cassandra_max_files: env_parse("CASSANDRA_MAX_FILES", 100_000),
            },
            redis: RedisConfig {
                host: env_str("REDIS_HOST", "127.0.0.1"),
                port: env_parse("REDIS_PORT", 6379),
                password: env_opt("REDIS_PASSWORD"),
                db: env_parse("REDIS_DB", 0),
                key_prefix: env_str("REDIS_KEY_PREFIX", "vod-edge:"),
                max_retries: env_parse("REDIS_MAX_RETRIES", 3),
                connect_timeout: env_secs("REDIS_CONNECT_TIMEOUT", 5),
                command_timeout: env_secs("REDIS_COMMAND_TIMEOUT", 2),
            },
            cassandra: CassandraConfig {
                hosts: env_str("CASSANDRA_HOSTS", "127.0.0.1:9042")
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect(),
                keyspace: env_str("CASSANDRA_KEYSPACE", "vod_edge"),
                username: env_opt("CASSANDRA_USERNAME"),
                password: env_opt("CASSANDRA_PASSWORD"),
                local_dc: env_opt("CASSANDRA_LOCAL_DC"),
                consistency: env_str("CASSANDRA_CONSISTENCY", "LOCAL_QUORUM"),
                replication_factor: env_parse("CASSANDRA_REPLICATION_FACTOR", 1),
                table: env_str("CASSANDRA_TABLE", "content_cache"),
                connect_timeout: env_secs("CASSANDRA_CONNECT_TIMEOUT", 10),
                request_timeout: env_secs("CASSANDRA_REQUEST_TIMEOUT", 5),
            },
            capacity: CapacityConfig {
                redis_threshold: env_parse("REDIS_CAPACITY_THRESHOLD", 85.0),
                cassandra_threshold: env_parse("CASSANDRA_CAPACITY_THRESHOLD", 90.0),
                check_interval: env_secs("CAPACITY_CHECK_INTERVAL", 60),
            },
        }
    }
}
