//! Job history over the file-result store.
//!
//! The history is not a separate dataset: every listing is derived from a
//! full scan of the append-only results store at call time, so pruning the
//! store immediately changes what history reports.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::batch::FileResult;
use crate::error::ParlanceError;
use crate::state::RetentionConfig;
use crate::storage::jsonl::JsonlStore;

/// Aggregated view of one completed (or partially completed) job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryEntry {
    pub job_id: String,
    pub lang: String,
    pub providers: Vec<String>,
    pub file_count: usize,
    pub result_count: usize,
    pub first_created_at: u64,
    pub last_created_at: u64,
}

/// History service over the append-only file-result store.
pub struct JobHistory {
    store: Arc<JsonlStore<FileResult>>,
    retention: RetentionConfig,
}

impl JobHistory {
    pub fn new(store: Arc<JsonlStore<FileResult>>, retention: RetentionConfig) -> Self {
        Self { store, retention }
    }

    /// Lists jobs derived from the store's rows, newest first.
    pub fn list(&self) -> Vec<JobHistoryEntry> {
        let mut jobs: HashMap<String, JobHistoryEntry> = HashMap::new();
        for result in self.store.scan() {
            let entry = jobs
                .entry(result.job_id.clone())
                .or_insert_with(|| JobHistoryEntry {
                    job_id: result.job_id.clone(),
                    lang: result.lang.clone(),
                    providers: Vec::new(),
                    file_count: 0,
                    result_count: 0,
                    first_created_at: result.created_at,
                    last_created_at: result.created_at,
                });
            if !entry.providers.contains(&result.provider) {
                entry.providers.push(result.provider.clone());
            }
            entry.result_count += 1;
            entry.first_created_at = entry.first_created_at.min(result.created_at);
            entry.last_created_at = entry.last_created_at.max(result.created_at);
        }

        // One row per (file, provider): file count is rows over providers.
        for entry in jobs.values_mut() {
            let providers = entry.providers.len().max(1);
            entry.file_count = entry.result_count.div_ceil(providers);
        }

        let mut list: Vec<_> = jobs.into_values().collect();
        list.sort_by(|a, b| b.last_created_at.cmp(&a.last_created_at));
        list
    }

    /// Results of one job, in persisted order.
    pub fn results_for(&self, job_id: &str) -> Vec<FileResult> {
        self.store
            .scan()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect()
    }

    /// Applies the retention policy to the backing store.
    pub fn prune(&self) -> Result<usize, ParlanceError> {
        self.store.prune(&self.retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NormalizationConfig;
    use crate::utils::now_millis_u64;

    fn result(job_id: &str, provider: &str, path: &str) -> FileResult {
        FileResult {
            job_id: job_id.to_string(),
            path: path.to_string(),
            provider: provider.to_string(),
            lang: "en".into(),
            duration_sec: 1.0,
            processing_time_ms: 200,
            rtf: 0.2,
            cer: None,
            wer: Some(0.1),
            latency_ms: None,
            text: "hello".into(),
            ref_text: None,
            degraded: false,
            created_at: now_millis_u64(),
            normalization_used: NormalizationConfig::default(),
        }
    }

    #[test]
    fn list_groups_rows_by_job() {
        let store = Arc::new(JsonlStore::in_memory());
        let history = JobHistory::new(Arc::clone(&store), RetentionConfig::default());

        store.append(result("j1", "a", "f1.wav")).unwrap();
        store.append(result("j1", "b", "f1.wav")).unwrap();
        store.append(result("j2", "a", "f2.wav")).unwrap();

        let list = history.list();
        assert_eq!(list.len(), 2);
        let j1 = list.iter().find(|e| e.job_id == "j1").unwrap();
        assert_eq!(j1.result_count, 2);
        assert_eq!(j1.providers.len(), 2);
        assert_eq!(j1.file_count, 1);
    }

    #[test]
    fn pruned_job_disappears_from_list() {
        let store = Arc::new(JsonlStore::in_memory());
        let history = JobHistory::new(Arc::clone(&store), RetentionConfig::default());
        store.append(result("j1", "a", "f1.wav")).unwrap();
        assert_eq!(history.list().len(), 1);

        store.retain(|r| r.job_id != "j1").unwrap();
        assert!(history.list().is_empty());
    }

    #[test]
    fn results_for_filters_by_job() {
        let store = Arc::new(JsonlStore::in_memory());
        let history = JobHistory::new(Arc::clone(&store), RetentionConfig::default());
        store.append(result("j1", "a", "f1.wav")).unwrap();
        store.append(result("j2", "a", "f2.wav")).unwrap();

        let results = history.results_for("j1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "f1.wav");
    }
}
