//! In-memory batch job index.
//!
//! Jobs live here while running and for a retention window after reaching a
//! terminal state; results remain queryable from storage after eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::normalize::NormalizationConfig;
use crate::storage::jsonl::Timestamped;

/// Options accepted on job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    /// Requested per-provider file parallelism.
    pub parallel: usize,
    /// Peak normalization target applied during audio preparation (dBFS).
    pub peak_dbfs: Option<f64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            peak_dbfs: None,
        }
    }
}

/// One (file, provider) outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub job_id: String,
    pub path: String,
    pub provider: String,
    pub lang: String,
    pub duration_sec: f64,
    pub processing_time_ms: u64,
    /// Real-time factor: processing time over audio duration.
    pub rtf: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_text: Option<String>,
    pub degraded: bool,
    pub created_at: u64,
    pub normalization_used: NormalizationConfig,
}

impl Timestamped for FileResult {
    fn recorded_at_ms(&self) -> u64 {
        self.created_at
    }
}

/// A per-file error recorded on the job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub message: String,
}

/// Terminality of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
}

/// One batch transcription job.
#[derive(Debug)]
pub struct BatchJob {
    pub id: String,
    pub providers: Vec<String>,
    pub lang: String,
    /// files x providers.
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub results: Vec<FileResult>,
    pub errors: Vec<JobError>,
    /// Reference transcripts keyed by file name.
    pub manifest: Option<HashMap<String, String>>,
    pub options: BatchOptions,
    pub normalization: NormalizationConfig,
    pub created_at: u64,
}

impl BatchJob {
    pub fn status(&self) -> JobStatus {
        if self.done + self.failed >= self.total {
            JobStatus::Completed
        } else {
            JobStatus::Running
        }
    }

    /// Progress snapshot for status polling.
    pub fn progress(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status(),
            "providers": self.providers,
            "lang": self.lang,
            "total": self.total,
            "done": self.done,
            "failed": self.failed,
            "errors": self.errors,
            "createdAt": self.created_at,
        })
    }
}

/// Concurrent job index with per-entry eviction timers.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<String, Arc<RwLock<BatchJob>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: BatchJob) -> Arc<RwLock<BatchJob>> {
        let id = job.id.clone();
        let entry = Arc::new(RwLock::new(job));
        self.jobs.insert(id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<BatchJob>>> {
        self.jobs.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, id: &str) -> bool {
        self.jobs.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Schedules eviction of a terminal job after the retention window.
    pub fn schedule_eviction(self: &Arc<Self>, job_id: String, retention_ms: u64) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(retention_ms)).await;
            if store.remove(&job_id) {
                log::debug!("[Batch] evicted job {} from memory", job_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_millis_u64;

    fn job(id: &str, total: usize) -> BatchJob {
        BatchJob {
            id: id.to_string(),
            providers: vec!["mock".into()],
            lang: "en".into(),
            total,
            done: 0,
            failed: 0,
            results: Vec::new(),
            errors: Vec::new(),
            manifest: None,
            options: BatchOptions::default(),
            normalization: NormalizationConfig::default(),
            created_at: now_millis_u64(),
        }
    }

    #[test]
    fn status_is_running_until_counts_reach_total() {
        let mut j = job("j1", 3);
        assert_eq!(j.status(), JobStatus::Running);
        j.done = 2;
        j.failed = 1;
        assert_eq!(j.status(), JobStatus::Completed);
    }

    #[test]
    fn store_inserts_and_fetches() {
        let store = JobStore::new();
        store.insert(job("j1", 1));
        assert!(store.get("j1").is_some());
        assert!(store.get("j2").is_none());
    }

    #[tokio::test]
    async fn eviction_removes_job_after_retention() {
        let store = Arc::new(JobStore::new());
        store.insert(job("j1", 1));
        store.schedule_eviction("j1".to_string(), 10);
        assert!(store.get("j1").is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("j1").is_none());
    }
}
