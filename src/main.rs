//! Service entry point: tracing, configuration, cache bring-up, capacity
//! watchdog and the HTTP server with graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vod_edge::cache::capacity::CapacityManager;
use vod_edge::cache::manager::CacheManager;
use vod_edge::config::Config;
use vod_edge::origin::S3ObjectStore;
use vod_edge::serve::{AppState, router};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.cache.mode,
        "starting vod-edge"
    );

    let cache = Arc::new(CacheManager::new(config.clone()));
    cache.init().await?;
    if cache.fallback_occurred().await {
        warn!("configured cache backend unavailable, running on memory fallback");
    }

    let capacity = CapacityManager::new(Arc::clone(&cache), &config.capacity);
    capacity.start_monitoring();

    let origin = Arc::new(S3ObjectStore::new(&config.origin));

    let state = AppState {
        config: Arc::new(config.clone()),
        cache: Arc::clone(&cache),
        capacity: Arc::clone(&capacity),
        origin,
        started_at: Instant::now(),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Ordered teardown: stop the watchdog (awaiting its in-flight tick),
    // then close the backend (awaiting tracked promotions).
    capacity.stop_monitoring().await;
    cache.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
