use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, MasterDb};
use crate::config::MasterConfig;

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    let dev_mode = state.config.server.dev;
    let mut app = api::api_router(&state)
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (or create) the database at the configured path.
pub fn open_db(config: &MasterConfig) -> Result<DbHandle> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = MasterDb::new(&config.server.db_path).context("Failed to initialize database")?;
    Ok(DbHandle::new(db))
}

/// Start the control-plane server and run until Ctrl+C.
pub async fn start_server(config: MasterConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let db = open_db(&config)?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, db)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "master control plane listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
