//! Exec stream server.
//!
//! Run with: cargo run -p exec-server
//!
//! Serves `ws://127.0.0.1:3000/shell.sock`. `EXEC_STREAM_ADDR` overrides the
//! listen address and `EXEC_STREAM_CONFIG` names a JSON file of session
//! settings.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{Router, routing::get};
use exec_stream_core::{ProcessEndpoint, ProcessError, SessionConfig};
use exec_stream_pty::{CommandSpec, spawn};
use exec_stream_session::SessionRegistry;
use exec_stream_transport::{ExecLauncher, ExecRequest, ExecState, create_exec_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Launches the requested command on this host.
struct LocalLauncher;

#[async_trait]
impl ExecLauncher for LocalLauncher {
    async fn launch(&self, request: &ExecRequest) -> Result<ProcessEndpoint, ProcessError> {
        let spec = CommandSpec::new(request.command.iter().cloned()).tty(request.tty);
        spawn(&spec)
            .await
            .map_err(|e| ProcessError::Other(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var_os("EXEC_STREAM_CONFIG") {
        Some(path) => SessionConfig::from_path(&path)
            .with_context(|| format!("Failed to load config from {}", path.to_string_lossy()))?,
        None => SessionConfig::default(),
    };
    let addr: SocketAddr = std::env::var("EXEC_STREAM_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("Invalid EXEC_STREAM_ADDR")?;

    let state = ExecState::new(LocalLauncher, config);
    let registry = Arc::clone(&state.registry);

    let app = Router::new()
        .route("/", get(|| async { "exec-stream server\n" }))
        .merge(create_exec_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on ws://{addr}/shell.sock");

    axum::serve(listener, app)
        .with_graceful_shutdown(drain_on_ctrl_c(registry))
        .await?;
    Ok(())
}

/// Resolve on ctrl-c once every live session has been told to shut down.
async fn drain_on_ctrl_c(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
    let count = registry.shutdown_all(Some("server shutting down")).await;
    tracing::info!(sessions = count, "Draining sessions");
    if !registry.wait_all(SHUTDOWN_GRACE).await {
        tracing::warn!("Sessions still open after {SHUTDOWN_GRACE:?}");
    }
}
