//! Admin endpoints: self-description, status, cache stats and control.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::json;
use sysinfo::{ProcessesToUpdate, System};
use tracing::info;

use super::AppState;
use crate::config::CacheMode;
use crate::error::ProxyError;

/// Self-description served at `/`.
pub async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cdn = &state.config.server.cdn_base_path;
    let proxy = &state.config.server.proxy_base_path;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": "edge CDN proxy for S3-hosted VOD assets",
        "endpoints": {
            "objects": format!("/{cdn}/{{bucket?}}/{{key}}"),
            "status": format!("/{proxy}/status"),
            "cache_stats": format!("/{proxy}/cache/stats"),
            "cache_clear": format!("/{proxy}/cache/clear"),
            "cache_switch": format!("/{proxy}/cache/switch"),
            "cache_health": format!("/{proxy}/cache/health"),
        },
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut sys = System::new();
    sys.refresh_memory();
    let process_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory())
    });

    Json(json!({
        "success": true,
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.server.environment,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "memory": {
            "process_bytes": process_bytes,
            "system_used_bytes": sys.used_memory(),
            "system_total_bytes": sys.total_memory(),
        },
    }))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.cache.stats().await;
    let capacity = state.cache.capacity().await;
    Json(json!({
        "success": true,
        "mode": state.cache.mode().await.as_str(),
        "stats": stats,
        "capacity": capacity,
    }))
}

pub async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.cache.clear().await;
    info!(cleared = cleared, "cache clear requested");
    Json(json!({ "success": cleared }))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub mode: String,
}

pub async fn cache_switch(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let mode: CacheMode = request
        .mode
        .parse()
        .map_err(ProxyError::BadRequest)?;
    let actual = state
        .cache
        .switch_backend(mode)
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "success": true,
        "mode": actual.as_str(),
        "requested": mode.as_str(),
    })))
}

pub async fn cache_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "healthy": state.cache.is_healthy().await,
        "mode": state.cache.mode().await.as_str(),
        "initialized": state.cache.is_initialized().await,
    }))
}
