//! Append-only JSONL persistence.
//!
//! One record per line, no schema version field. Every store keeps an
//! in-memory mirror (the whole dataset is small); a configured path makes
//! appends durable and reloads the mirror at startup. Pruning rewrites the
//! file atomically (temp file + rename) under a per-store lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ParlanceError;
use crate::state::RetentionConfig;
use crate::utils::now_millis_u64;

/// Row types that can be pruned by age.
pub trait Timestamped {
    /// The row's creation time (ms since epoch).
    fn recorded_at_ms(&self) -> u64;
}

/// Append-only store of one JSONL file (or memory only when no path is set).
pub struct JsonlStore<T> {
    rows: RwLock<Vec<T>>,
    path: Option<PathBuf>,
    io_lock: Mutex<()>,
}

impl<T> JsonlStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Creates a memory-only store.
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            path: None,
            io_lock: Mutex::new(()),
        }
    }

    /// Opens a file-backed store, loading existing rows.
    ///
    /// Corrupt lines are skipped with a warning; an absent file is an empty
    /// store.
    pub fn open(path: PathBuf) -> Result<Self, ParlanceError> {
        let mut rows = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for (idx, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<T>(line) {
                        Ok(row) => rows.push(row),
                        Err(e) => {
                            log::warn!(
                                "[Store] {} line {}: skipping corrupt row: {}",
                                path.display(),
                                idx + 1,
                                e
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ParlanceError::Storage(e.to_string())),
        }
        Ok(Self {
            rows: RwLock::new(rows),
            path: Some(path),
            io_lock: Mutex::new(()),
        })
    }

    /// Appends one row.
    ///
    /// Durable first: when the file write fails, the row is NOT added to the
    /// memory mirror, so memory never claims more than storage holds.
    pub fn append(&self, row: T) -> Result<(), ParlanceError> {
        if let Some(path) = &self.path {
            let line =
                serde_json::to_string(&row).map_err(|e| ParlanceError::Storage(e.to_string()))?;
            let _guard = self.io_lock.lock();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ParlanceError::Storage(e.to_string()))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ParlanceError::Storage(e.to_string()))?;
            writeln!(file, "{}", line).map_err(|e| ParlanceError::Storage(e.to_string()))?;
        }
        self.rows.write().push(row);
        Ok(())
    }

    /// Full scan of all rows.
    pub fn scan(&self) -> Vec<T> {
        self.rows.read().clone()
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Retains only rows matching the predicate, rewriting the file if
    /// anything was removed. Returns the number of removed rows.
    pub fn retain(&self, keep: impl Fn(&T) -> bool) -> Result<usize, ParlanceError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| keep(row));
        let removed = before - rows.len();
        if removed > 0 {
            self.rewrite(&rows)?;
        }
        Ok(removed)
    }

    /// Atomic rewrite of the backing file from the given rows.
    fn rewrite(&self, rows: &[T]) -> Result<(), ParlanceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.io_lock.lock();
        let mut contents = String::new();
        for row in rows {
            let line =
                serde_json::to_string(row).map_err(|e| ParlanceError::Storage(e.to_string()))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        let temp = path.with_extension("jsonl.tmp");
        std::fs::write(&temp, contents).map_err(|e| ParlanceError::Storage(e.to_string()))?;
        std::fs::rename(&temp, path).map_err(|e| ParlanceError::Storage(e.to_string()))
    }
}

impl<T> JsonlStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Timestamped,
{
    /// Applies a retention policy: drops rows older than `retention_ms` and
    /// trims the oldest rows beyond `max_rows`. Returns removed count.
    pub fn prune(&self, retention: &RetentionConfig) -> Result<usize, ParlanceError> {
        let now = now_millis_u64();
        let mut rows = self.rows.write();
        let before = rows.len();

        if retention.retention_ms > 0 {
            let cutoff = now.saturating_sub(retention.retention_ms);
            rows.retain(|row| row.recorded_at_ms() >= cutoff);
        }
        if retention.max_rows > 0 && rows.len() > retention.max_rows {
            let excess = rows.len() - retention.max_rows;
            // Rows append in arrival order; the head is the oldest.
            rows.drain(..excess);
        }

        let removed = before - rows.len();
        if removed > 0 {
            self.rewrite(&rows)?;
        }
        Ok(removed)
    }
}
