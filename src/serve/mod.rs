//! HTTP surface: object delivery under the CDN base path and the admin
//! endpoints under the proxy base path.

pub mod admin;
pub mod mime;
pub mod object;

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::cache::capacity::CapacityManager;
use crate::cache::manager::CacheManager;
use crate::config::Config;
use crate::error::ProxyError;
use crate::origin::ObjectStore;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheManager>,
    pub capacity: Arc<CapacityManager>,
    pub origin: Arc<dyn ObjectStore>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    let cdn = Router::new().route(
        "/{*path}",
        get(object::get_object).head(object::head_object),
    );
    let admin = Router::new()
        .route("/status", get(admin::status))
        .route("/cache/stats", get(admin::cache_stats))
        .route("/cache/clear", post(admin::cache_clear))
        .route("/cache/switch", post(admin::cache_switch))
        .route("/cache/health", get(admin::cache_health));

    Router::new()
        .route("/", get(admin::root))
        .nest(&format!("/{}", state.config.server.cdn_base_path), cdn)
        .nest(&format!("/{}", state.config.server.proxy_base_path), admin)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Split a request path into `(bucket, key)`.
///
/// One segment maps to the default bucket. With more, a first segment
/// without a file extension names the bucket; otherwise the whole path is
/// a key in the default bucket.
pub fn parse_object_path(
    path: &str,
    default_bucket: &str,
) -> Result<(String, String), ProxyError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => Err(ProxyError::BadRequest("missing object path".into())),
        [single] => Ok((default_bucket.to_string(), (*single).to_string())),
        [first, rest @ ..] => {
            if first.contains('.') {
                Ok((default_bucket.to_string(), segments.join("/")))
            } else {
                Ok(((*first).to_string(), rest.join("/")))
            }
        }
    }
}
