//! Parlance Server - standalone headless STT comparison server.
//!
//! Hosts the live streaming endpoints (stream/compare/replay/voice) and the
//! batch transcription API as a background daemon. Provider adapters are
//! linked in here; a deployment without external adapters runs with the
//! built-in mock so the pipeline stays exercisable.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parlance_core::providers::mock::MockProvider;
use parlance_core::{start_server, AppState, ProviderRegistry};
use tokio::signal;

use crate::config::ServerConfig;

/// Parlance Server - headless speech-to-text comparison server.
#[derive(Parser, Debug)]
#[command(name = "parlance-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PARLANCE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "PARLANCE_BIND_PORT")]
    port: Option<u16>,

    /// Data directory for persistent stores (JSONL).
    #[arg(short = 'd', long, env = "PARLANCE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Parlance Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    let core_config = config.to_core_config();
    core_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    if let Some(dir) = &core_config.data_dir {
        parlance_core::storage::ensure_data_dir(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        log::info!("Using data directory: {}", dir.display());
    } else {
        log::info!("No data directory configured - stores are memory-only");
    }

    // Provider adapters. External adapter crates register here; without any,
    // the deterministic mock keeps the endpoints usable for development.
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MockProvider::named("mock")));
    log::warn!("No external STT adapters linked - running with the built-in mock provider");

    let app_state = AppState::builder()
        .registry(Arc::new(registry))
        .config(Arc::new(core_config))
        .build();
    app_state.start_background_tasks();

    log::info!("Services bootstrapped successfully");

    // Spawn the HTTP/WS server on the main runtime.
    let server_state = app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Signal live sockets to drain (they persist latency summaries and
    // session-end rows on the way out), then stop accepting traffic.
    let signaled = app_state.ws_manager.close_all();
    if signaled > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    server_handle.abort();
    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
