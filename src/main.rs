use anyhow::Result;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sliding_ratelimit::{
    config::{load_routes_from_file, CompiledRoutes, Settings},
    limiter::RateLimiter,
    metrics::Metrics,
    redis::SharedStore,
    service::{router, RateLimitService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sliding_ratelimit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sliding window rate limit service");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?;

    let routes = match &settings.routes_path {
        Some(path) => {
            info!("Loading route policies from: {}", path);
            let routes = CompiledRoutes::compile(load_routes_from_file(path)?)?;
            for (name, policy) in routes.routes() {
                info!(
                    "Route {}: {} requests per {}ms",
                    name, policy.max_requests, policy.window_ms
                );
            }
            routes
        }
        None => {
            warn!("No route policies configured; every check will be rejected as unknown");
            CompiledRoutes::default()
        }
    };

    // Connects lazily on the first store call
    let store = Arc::new(SharedStore::new(settings.redis.to_redis_config()));
    let metrics = Arc::new(Metrics::new()?);
    let limiter = Arc::new(RateLimiter::from_settings(
        store.clone(),
        &settings,
        metrics,
    )?);
    let service = Arc::new(RateLimitService::new(limiter.clone(), routes));

    let sweeper = match (settings.limiter.sweep_interval_secs, service.max_window_ms()) {
        (Some(secs), Some(max_window_ms)) => {
            info!("Sweeping stale windows every {}s", secs);
            Some(limiter.spawn_sweeper(Duration::from_secs(secs), max_window_ms))
        }
        _ => None,
    };

    let http_addr = settings.server.http_addr.parse::<SocketAddr>()?;
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    let app = router(service);
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    store.close().await;

    info!("Service stopped");
    Ok(())
}
