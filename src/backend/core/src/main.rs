//! Driftbox Server - Main entry point
//!
//! Boots the governed HTTP surface: counter store, rate limiter, and
//! the health endpoint the deployment probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::trace::TraceLayer;

use driftbox_core::{
    config::Config,
    middleware::{RateLimitConfig, RateLimitLayer, SlidingWindowLimiter},
    store::{CounterStore, MemoryStore, RedisStore, RedisStoreConfig},
    telemetry,
};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn CounterStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    let environment =
        std::env::var("DRIFTBOX_ENV").unwrap_or_else(|_| "development".to_string());
    telemetry::init_logging(&config.logging, &environment)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Driftbox Server"
    );

    // Shared counter store: Redis, or in-memory when Redis is not
    // reachable at startup (local development).
    let store: Arc<dyn CounterStore> = match RedisStore::connect(RedisStoreConfig {
        url: config.redis.url.clone(),
        connect_timeout: Duration::from_millis(config.redis.connect_timeout_ms),
        command_timeout: Duration::from_millis(config.redis.command_timeout_ms),
    })
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, using in-memory counter store");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = Arc::new(SlidingWindowLimiter::new(store.clone()));
    let rate_limit = RateLimitConfig::from_settings(&config.rate_limit);
    tracing::info!(
        max_requests = rate_limit.max_requests,
        window_ms = rate_limit.window_ms,
        "Rate limiting enabled"
    );

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .layer(RateLimitLayer::new(limiter, rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { store });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Liveness/readiness probe. Reports degraded when the counter store is
/// unreachable; the governed surface stays up regardless (fail-open).
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.store.ping().await.is_ok();
    Json(serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": {
            "backend": state.store.name(),
            "reachable": store_ok,
        },
    }))
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
