/// Server setup and initialization
///
/// Wires together the workflow registry, the instance engine and the HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_instance_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::engine::WorkflowEngine,
    workflow::registry::WorkflowRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Create the main Axum application with all routes
///
/// Must be called inside a Tokio runtime; the engine's scheduler loop is
/// spawned here.
pub fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new());

    tracing::info!("🚀 Initializing workflow engine");
    let engine = Arc::new(WorkflowEngine::new());

    tracing::info!(
        "⚙️ Engine defaults: autoAdvance={}, stepDelay={}ms",
        config.engine.auto_advance,
        config.engine.step_delay_ms
    );
    let app_state = AppState {
        registry,
        engine,
        defaults: config.engine,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Definition and instance API routes
        .merge(create_workflow_routes())
        .merge(create_instance_routes())
        .with_state(app_state);

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
///
/// Initializes logging, creates the application and serves it on the configured address.
pub async fn start_server(config: Config) -> Result<()> {
    // RUST_LOG overrides the default `info` level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting boardflow server...");

    let app = create_app(config.clone())?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
