//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to services.
//! It provides the router construction and server startup functionality.

use std::sync::Arc;

use thiserror::Error;

use crate::batch::{BatchRunner, JobStore, NormalizedAudioCache};
use crate::providers::ProviderRegistry;
use crate::session::{AssistantVoice, EchoAssistant, ReplaySessionStore, SessionContext};
use crate::state::Config;
use crate::storage::{JobHistory, RealtimeLog, Stores};

pub mod http;
pub mod voice;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::{ConnectionGuard, Endpoint, WsConnectionManager};

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services.
/// All business logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Registered provider adapters.
    pub registry: Arc<ProviderRegistry>,
    /// Persistent stores (results, latency, realtime journal).
    pub stores: Arc<Stores>,
    /// Realtime transcript journal service.
    pub realtime_log: Arc<RealtimeLog>,
    /// Job history over the results store.
    pub history: Arc<JobHistory>,
    /// In-memory batch job index.
    pub jobs: Arc<JobStore>,
    /// Batch pipeline.
    pub runner: Arc<BatchRunner>,
    /// Take-once replay bindings.
    pub replay_sessions: Arc<ReplaySessionStore>,
    /// Voice assistant backend.
    pub assistant: Arc<dyn AssistantVoice>,
    /// Live socket connection tracking.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Application configuration (immutable after load).
    pub config: Arc<Config>,
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }

    /// The service bundle live sessions need.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            realtime_log: Arc::clone(&self.realtime_log),
            latency_store: Arc::clone(&self.stores.latency),
            config: Arc::clone(&self.config),
        }
    }

    /// Spawns the periodic maintenance tasks (store pruning, replay sweep).
    pub fn start_background_tasks(&self) {
        let realtime_log = Arc::clone(&self.realtime_log);
        let history = Arc::clone(&self.history);
        let replay = Arc::clone(&self.replay_sessions);
        let interval_ms = self.config.realtime_log.prune_interval_ms.max(1000);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = realtime_log.prune() {
                    log::warn!("[Maintenance] realtime log prune failed: {}", e);
                }
                if let Err(e) = history.prune() {
                    log::warn!("[Maintenance] history prune failed: {}", e);
                }
                for path in replay.sweep_expired() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        log::debug!(
                            "[Maintenance] expired replay file {} not removed: {}",
                            path.display(),
                            e
                        );
                    }
                }
            }
        });
    }
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    registry: Option<Arc<ProviderRegistry>>,
    config: Option<Arc<Config>>,
    stores: Option<Arc<Stores>>,
    assistant: Option<Arc<dyn AssistantVoice>>,
}

impl AppStateBuilder {
    /// Sets the provider registry (required).
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the configuration (required).
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets pre-opened stores. Defaults to opening per the config.
    pub fn stores(mut self, stores: Arc<Stores>) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Sets the assistant backend. Defaults to the canned echo assistant.
    pub fn assistant(mut self, assistant: Arc<dyn AssistantVoice>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        let registry = self.registry.expect("registry is required");
        let config = self.config.expect("config is required");
        let stores = match self.stores {
            Some(stores) => stores,
            None => Arc::new(Stores::open(&config).expect("failed to open stores")),
        };

        let realtime_log = Arc::new(RealtimeLog::new(
            Arc::clone(&stores.realtime),
            config.realtime_log,
        ));
        let history = Arc::new(JobHistory::new(Arc::clone(&stores.results), config.history));
        let jobs = Arc::new(JobStore::new());
        let runner = Arc::new(BatchRunner::new(
            Arc::clone(&registry),
            Arc::clone(&jobs),
            Arc::new(NormalizedAudioCache::new()),
            Arc::clone(&stores.results),
            Arc::clone(&config),
        ));

        AppState {
            registry,
            stores,
            realtime_log,
            history,
            jobs,
            runner,
            replay_sessions: Arc::new(ReplaySessionStore::default()),
            assistant: self
                .assistant
                .unwrap_or_else(|| Arc::new(EchoAssistant)),
            ws_manager: Arc::new(WsConnectionManager::new()),
            config,
        }
    }
}

async fn find_available_port(
    start: u16,
    end: u16,
) -> Result<(u16, tokio::net::TcpListener), ServerError> {
    for port in start..=end {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Starts the HTTP server on the configured or auto-discovered port.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let preferred_port = state.config.preferred_port;
    let (port, listener) = if preferred_port > 0 {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], preferred_port));
        (preferred_port, tokio::net::TcpListener::bind(&addr).await?)
    } else {
        find_available_port(48100, 48110).await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
