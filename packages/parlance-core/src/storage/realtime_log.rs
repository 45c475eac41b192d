//! Realtime transcript journal.
//!
//! Append-only log of session, transcript, error, and session-end events
//! for every live provider lane. Retention is time- and row-bounded; the
//! session listing aggregates rows by (session id, provider).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParlanceError;
use crate::state::RetentionConfig;
use crate::storage::jsonl::{JsonlStore, Timestamped};
use crate::utils::now_millis_u64;

/// Payload of one journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimePayload {
    /// Session opened; carries the negotiated configuration snapshot.
    Session {
        started_at: u64,
        config: serde_json::Value,
    },
    /// One emitted transcript.
    #[serde(rename_all = "camelCase")]
    Transcript {
        text: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<f64>,
    },
    /// A provider- or session-scoped error.
    Error { message: String },
    /// Session closed.
    SessionEnd {},
}

/// One journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeLogEntry {
    pub session_id: String,
    pub provider: String,
    pub lang: String,
    pub recorded_at: u64,
    pub payload: RealtimePayload,
}

impl Timestamped for RealtimeLogEntry {
    fn recorded_at_ms(&self) -> u64 {
        self.recorded_at
    }
}

/// Aggregated view of one (session, provider) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeSessionSummary {
    pub session_id: String,
    pub provider: String,
    pub lang: String,
    /// From the latest `session` payload, when one was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    pub last_recorded_at: u64,
    pub transcript_count: usize,
    pub error_count: usize,
}

/// Journal service over the append-only store.
pub struct RealtimeLog {
    store: Arc<JsonlStore<RealtimeLogEntry>>,
    retention: RetentionConfig,
}

impl RealtimeLog {
    pub fn new(store: Arc<JsonlStore<RealtimeLogEntry>>, retention: RetentionConfig) -> Self {
        Self { store, retention }
    }

    fn append(
        &self,
        session_id: &str,
        provider: &str,
        lang: &str,
        payload: RealtimePayload,
    ) -> Result<(), ParlanceError> {
        self.store.append(RealtimeLogEntry {
            session_id: session_id.to_string(),
            provider: provider.to_string(),
            lang: lang.to_string(),
            recorded_at: now_millis_u64(),
            payload,
        })
    }

    /// Records a session-open row with the negotiated config snapshot.
    pub fn log_session(
        &self,
        session_id: &str,
        provider: &str,
        lang: &str,
        config: serde_json::Value,
    ) {
        let payload = RealtimePayload::Session {
            started_at: now_millis_u64(),
            config,
        };
        if let Err(e) = self.append(session_id, provider, lang, payload) {
            log::warn!("[RtLog] session row failed: {}", e);
        }
    }

    /// Records one emitted transcript.
    pub fn log_transcript(
        &self,
        session_id: &str,
        provider: &str,
        lang: &str,
        text: &str,
        is_final: bool,
        latency_ms: Option<f64>,
    ) {
        let payload = RealtimePayload::Transcript {
            text: text.to_string(),
            is_final,
            latency_ms,
        };
        if let Err(e) = self.append(session_id, provider, lang, payload) {
            log::warn!("[RtLog] transcript row failed: {}", e);
        }
    }

    /// Records an error row. Written before the wire error is sent so
    /// diagnostics survive a dead socket.
    pub fn log_error(&self, session_id: &str, provider: &str, lang: &str, message: &str) {
        let payload = RealtimePayload::Error {
            message: message.to_string(),
        };
        if let Err(e) = self.append(session_id, provider, lang, payload) {
            log::warn!("[RtLog] error row failed: {}", e);
        }
    }

    /// Records session close.
    pub fn log_session_end(&self, session_id: &str, provider: &str, lang: &str) {
        if let Err(e) = self.append(session_id, provider, lang, RealtimePayload::SessionEnd {}) {
            log::warn!("[RtLog] session_end row failed: {}", e);
        }
    }

    /// Aggregates journal rows by (session id, provider).
    pub fn list_sessions(&self) -> Vec<RealtimeSessionSummary> {
        let mut sessions: HashMap<(String, String), RealtimeSessionSummary> = HashMap::new();
        for entry in self.store.scan() {
            let key = (entry.session_id.clone(), entry.provider.clone());
            let summary = sessions
                .entry(key)
                .or_insert_with(|| RealtimeSessionSummary {
                    session_id: entry.session_id.clone(),
                    provider: entry.provider.clone(),
                    lang: entry.lang.clone(),
                    started_at: None,
                    last_recorded_at: 0,
                    transcript_count: 0,
                    error_count: 0,
                });
            summary.last_recorded_at = summary.last_recorded_at.max(entry.recorded_at);
            match entry.payload {
                RealtimePayload::Session { started_at, .. } => {
                    summary.started_at = Some(started_at);
                }
                RealtimePayload::Transcript { .. } => summary.transcript_count += 1,
                RealtimePayload::Error { .. } => summary.error_count += 1,
                RealtimePayload::SessionEnd {} => {}
            }
        }
        let mut list: Vec<_> = sessions.into_values().collect();
        list.sort_by(|a, b| b.last_recorded_at.cmp(&a.last_recorded_at));
        list
    }

    /// Applies the retention policy.
    pub fn prune(&self) -> Result<usize, ParlanceError> {
        self.store.prune(&self.retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> RealtimeLog {
        RealtimeLog::new(
            Arc::new(JsonlStore::in_memory()),
            RetentionConfig::default(),
        )
    }

    #[test]
    fn listing_aggregates_by_session_and_provider() {
        let rt = log();
        rt.log_session("s1", "alpha", "en", serde_json::json!({}));
        rt.log_transcript("s1", "alpha", "en", "hello", true, Some(100.0));
        rt.log_transcript("s1", "alpha", "en", "world", true, Some(110.0));
        rt.log_session("s1", "beta", "en", serde_json::json!({}));
        rt.log_error("s1", "beta", "en", "boom");
        rt.log_session_end("s1", "alpha", "en");

        let sessions = rt.list_sessions();
        assert_eq!(sessions.len(), 2);

        let alpha = sessions
            .iter()
            .find(|s| s.provider == "alpha")
            .expect("alpha session");
        assert_eq!(alpha.transcript_count, 2);
        assert!(alpha.started_at.is_some());

        let beta = sessions.iter().find(|s| s.provider == "beta").unwrap();
        assert_eq!(beta.error_count, 1);
    }

    #[test]
    fn last_recorded_at_is_max_of_rows() {
        let rt = log();
        rt.log_session("s1", "alpha", "en", serde_json::json!({}));
        rt.log_session_end("s1", "alpha", "en");
        let sessions = rt.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].last_recorded_at >= sessions[0].started_at.unwrap());
    }

    #[test]
    fn prune_by_row_cap() {
        let store = Arc::new(JsonlStore::in_memory());
        let rt = RealtimeLog::new(
            Arc::clone(&store),
            RetentionConfig {
                retention_ms: 0,
                max_rows: 2,
                prune_interval_ms: 1000,
            },
        );
        for i in 0..5 {
            rt.log_transcript("s1", "p", "en", &format!("t{i}"), true, None);
        }
        assert_eq!(rt.prune().unwrap(), 3);
        assert_eq!(store.len(), 2);
    }
}
