use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState, SharedState};
use super::db::{BoardDb, DbHandle};
use super::ws::{self, KeepAlive};

/// Configuration for the board server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    pub keepalive: KeepAlive,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: std::path::PathBuf::from(".kanban/board.db"),
            dev_mode: false,
            keepalive: KeepAlive::default(),
        }
    }
}

/// Build the full application router with the REST API and the change feed.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Open the database and assemble shared state.
pub fn build_state(config: &ServerConfig) -> Result<SharedState> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = BoardDb::new(&config.db_path).context("Failed to initialize board database")?;
    let mut state = AppState::new(DbHandle::new(db));
    state.keepalive = config.keepalive;
    Ok(Arc::new(state))
}

/// A server bound to a local address and running in the background.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub state: SharedState,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl RunningServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Stop accepting connections and wait for the server task to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await.context("Server task panicked")?
    }
}

/// Bind `addr` and serve `state` on a background task until `shutdown` is
/// called. Port 0 picks an ephemeral port.
pub async fn spawn_server(state: SharedState, addr: &str, dev_mode: bool) -> Result<RunningServer> {
    let mut app = build_router(state.clone());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("Server error")
    });

    Ok(RunningServer {
        addr: local_addr,
        state,
        shutdown,
        handle,
    })
}

/// Start the board server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config)?;

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let server = spawn_server(state, &addr, config.dev_mode).await?;

    info!(addr = %server.addr, db = %config.db_path.display(), "Kanban board running");
    println!("Kanban board running at {}", server.base_url());

    shutdown_signal().await;
    server.shutdown().await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
