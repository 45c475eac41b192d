//! Persistence layer: append-only JSONL stores and the services over them.

pub mod history;
pub mod jsonl;
pub mod realtime_log;

pub use history::{JobHistory, JobHistoryEntry};
pub use jsonl::{JsonlStore, Timestamped};
pub use realtime_log::{RealtimeLog, RealtimeLogEntry, RealtimePayload, RealtimeSessionSummary};

use std::path::Path;
use std::sync::Arc;

use crate::batch::FileResult;
use crate::error::ParlanceError;
use crate::latency::LatencySummary;
use crate::state::Config;

impl Timestamped for LatencySummary {
    fn recorded_at_ms(&self) -> u64 {
        self.ended_at
    }
}

/// All persistent stores, opened together.
pub struct Stores {
    pub results: Arc<JsonlStore<FileResult>>,
    pub latency: Arc<JsonlStore<LatencySummary>>,
    pub realtime: Arc<JsonlStore<RealtimeLogEntry>>,
}

impl Stores {
    /// Opens file-backed stores under `data_dir`, or memory-only stores when
    /// the config has no data directory.
    pub fn open(config: &Config) -> Result<Self, ParlanceError> {
        match &config.data_dir {
            Some(dir) => Ok(Self {
                results: Arc::new(JsonlStore::open(dir.join("results.jsonl"))?),
                latency: Arc::new(JsonlStore::open(dir.join("latency.jsonl"))?),
                realtime: Arc::new(JsonlStore::open(dir.join("realtime.jsonl"))?),
            }),
            None => Ok(Self::in_memory()),
        }
    }

    /// Memory-only stores (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self {
            results: Arc::new(JsonlStore::in_memory()),
            latency: Arc::new(JsonlStore::in_memory()),
            realtime: Arc::new(JsonlStore::in_memory()),
        }
    }
}

/// Lists the most recent latency summaries, newest first.
pub fn recent_latency(
    store: &JsonlStore<LatencySummary>,
    limit: usize,
) -> Vec<LatencySummary> {
    let mut rows = store.scan();
    rows.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
    rows.truncate(limit);
    rows
}

/// Ensures a data directory exists before opening stores in it.
pub fn ensure_data_dir(dir: &Path) -> Result<(), ParlanceError> {
    std::fs::create_dir_all(dir).map_err(|e| ParlanceError::Storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::LatencyStats;

    fn summary(session: &str, ended_at: u64) -> LatencySummary {
        LatencySummary {
            session_id: session.to_string(),
            provider: "mock".into(),
            lang: "en".into(),
            stats: LatencyStats::from_samples(&[100.0]).unwrap(),
            started_at: ended_at - 1000,
            ended_at,
        }
    }

    #[test]
    fn recent_latency_orders_and_limits() {
        let store = JsonlStore::in_memory();
        store.append(summary("s1", 100)).unwrap();
        store.append(summary("s2", 300)).unwrap();
        store.append(summary("s3", 200)).unwrap();

        let recent = recent_latency(&store, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "s2");
        assert_eq!(recent[1].session_id, "s3");
    }

    #[test]
    fn stores_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let stores = Stores::open(&config).unwrap();
        stores.latency.append(summary("s1", 100)).unwrap();
        assert!(dir.path().join("latency.jsonl").exists());
    }
}
