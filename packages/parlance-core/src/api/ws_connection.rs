//! WebSocket connection tracking.
//!
//! Every live socket (stream/compare/replay/voice) registers here. The
//! manager hands each handler a cancellation token so shutdown can
//! force-close all sessions, and an RAII guard so a panicking handler still
//! unregisters itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Which endpoint a connection came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Stream,
    Compare,
    Replay,
    Voice,
}

impl Endpoint {
    fn tag(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Compare => "compare",
            Self::Replay => "replay",
            Self::Voice => "voice",
        }
    }
}

/// Tracks all active socket connections.
///
/// Thread-safe for concurrent handlers. A hierarchical cancellation token
/// lets `close_all` signal every live handler at once; a fresh token is
/// installed afterwards so new connections keep working.
pub struct WsConnectionManager {
    connections: DashMap<String, Endpoint>,
    next_id: AtomicU64,
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection, returning its RAII guard.
    pub fn register(self: &Arc<Self>, endpoint: Endpoint) -> ConnectionGuard {
        let id = format!(
            "{}-{}",
            endpoint.tag(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let cancel_token = self.global_cancel.read().child_token();
        self.connections.insert(id.clone(), endpoint);
        log::debug!(
            "[WS] connection {} registered ({} active)",
            id,
            self.connections.len()
        );
        ConnectionGuard {
            id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            log::debug!(
                "[WS] connection {} unregistered ({} remaining)",
                id,
                self.connections.len()
            );
        }
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Signals every live handler to close. Returns how many were signaled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters its connection when dropped.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token to watch in the handler's select loop; cancelled on shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}
