/// Boardflow: workflow runtime for a collaborative planning board
///
/// Main entry point for the boardflow server. Initializes configuration and starts
/// the HTTP server with workflow registration and instance control.

use boardflow::{config::Config, server::start_server};

/// Application entry point
///
/// Loads configuration from the environment and starts listening for requests.
/// The server provides:
/// - Workflow definitions at /api/workflows/*
/// - Instance control at /api/instances/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004, overridable through BOARDFLOW_* variables
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
