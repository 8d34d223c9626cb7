//! HTTP surface for the dashboard: batch control, session snapshots, SSE
//! streams and CI polling.

pub mod api;
pub mod sse;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use api::{AppState, SharedState};

/// Configuration for the bridge server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a dashboard served from another origin.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            dev_mode: false,
        }
    }
}

pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve until Ctrl-C, then cancel every batch still running.
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<()> {
    let state = Arc::new(state);
    let app = build_router(Arc::clone(&state), config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, dev_mode = config.dev_mode, "Bridge server listening");
    println!("Ralph bridge running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let batches = state.batches.lock().unwrap_or_else(|e| e.into_inner());
    let cancelled = batches.values().filter(|h| h.cancel()).count();
    if cancelled > 0 {
        tracing::info!(cancelled, "Cancelled running batches on shutdown");
    }
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
