//! PEERQUIZ Relay Entry Point
//!
//! Bootstraps configuration, wires the stores and background tasks,
//! and runs the Axum server until a shutdown signal arrives. Shutdown
//! is ordered and bounded: stop accepting, drain connections with a
//! normal close, stop the change bridge, stop the reconciler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peerquiz_relay::{
    bridge::change_bridge_task, create_router, reconciler::reconciler_task, ApiError, ApiResult,
    AppState, BackendClient, RelayConfig,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ApiResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let backend = Arc::new(BackendClient::new(&config)?);
    let state = AppState::new(config.clone(), backend);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge_handle = tokio::spawn(change_bridge_task(
        config.clone(),
        Arc::clone(&state.cache),
        Arc::clone(&state.fanout),
        Arc::clone(&state.bridge_counters),
        shutdown_rx.clone(),
    ));

    let reconciler_handle = tokio::spawn(reconciler_task(
        Arc::clone(&state.presence),
        Arc::clone(&state.cache),
        Arc::clone(&state.fanout),
        Arc::clone(&state.gateway),
        config.reconciler_interval(),
        config.presence_expiry_window,
        Arc::clone(&state.reconciler_counters),
        shutdown_rx,
    ));

    let app = create_router(state.clone());
    let addr = resolve_bind_addr(&config)?;
    tracing::info!(%addr, "starting peerquiz relay");

    // Failing to bind is the one process-fatal condition.
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // The listener is gone at this point; no new connections arrive.
    let _ = shutdown_tx.send(true);
    state.gateway.drain(Duration::from_secs(3)).await;

    for (name, handle) in [("bridge", bridge_handle), ("reconciler", reconciler_handle)] {
        if tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            tracing::warn!(task = name, "background task did not stop in time");
        }
    }

    tracing::info!("peerquiz relay stopped");
    Ok(())
}

fn resolve_bind_addr(config: &RelayConfig) -> ApiResult<SocketAddr> {
    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("invalid bind address {}: {}", addr, e)))
}
