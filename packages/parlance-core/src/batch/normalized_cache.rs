//! Process-wide normalized-audio cache.
//!
//! The batch pipeline prepares each input file once (decode + peak
//! normalization to a WAV) and reuses it across providers and jobs. Entries
//! are reference-counted; when the count drops to zero the entry is evicted
//! and the WAV is deleted if the cache generated it. Concurrent ensures for
//! the same key coalesce behind a per-key mutex so the work runs once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::ParlanceError;

/// Cache key: identity of the source file plus the preparation parameters.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CacheKey {
    pub path: PathBuf,
    pub mtime_ms: u64,
    pub size: u64,
    pub target_rate: u32,
    pub target_channels: u16,
    /// Peak target in centi-dBFS (integer so the key stays hashable).
    pub peak_centi_dbfs: Option<i32>,
}

impl CacheKey {
    /// Derives a key for a file from its current metadata.
    pub fn for_file(
        path: &Path,
        target_rate: u32,
        target_channels: u16,
        peak_dbfs: Option<f64>,
    ) -> Result<Self, ParlanceError> {
        let abs = path
            .canonicalize()
            .map_err(|e| ParlanceError::Storage(format!("{}: {}", path.display(), e)))?;
        let meta = std::fs::metadata(&abs)
            .map_err(|e| ParlanceError::Storage(format!("{}: {}", abs.display(), e)))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            path: abs,
            mtime_ms,
            size: meta.len(),
            target_rate,
            target_channels,
            peak_centi_dbfs: peak_dbfs.map(|db| (db * 100.0).round() as i32),
        })
    }
}

struct CacheEntry {
    wav_path: PathBuf,
    /// True when the cache created this file (and therefore deletes it).
    generated: bool,
    refcount: usize,
}

/// A live reference to a cached normalized WAV.
///
/// Must be given back via [`NormalizedAudioCache::release`]; the runner
/// releases on every exit path.
#[derive(Debug, Clone)]
pub struct NormalizedHandle {
    pub key: CacheKey,
    pub wav_path: PathBuf,
}

/// Refcounted cache of prepared audio files.
#[derive(Default)]
pub struct NormalizedAudioCache {
    entries: DashMap<CacheKey, CacheEntry>,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl NormalizedAudioCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the normalized WAV for `key`, producing it if absent.
    ///
    /// `produce` returns the prepared file's path and whether the cache owns
    /// it (generated files are deleted on final release; original inputs
    /// never are). Concurrent acquires for the same key run `produce` once.
    pub async fn acquire<F, Fut>(
        &self,
        key: CacheKey,
        produce: F,
    ) -> Result<NormalizedHandle, ParlanceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(PathBuf, bool), ParlanceError>>,
    {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.refcount += 1;
            return Ok(NormalizedHandle {
                key,
                wav_path: entry.wav_path.clone(),
            });
        }

        let (wav_path, generated) = produce().await?;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                wav_path: wav_path.clone(),
                generated,
                refcount: 1,
            },
        );
        Ok(NormalizedHandle { key, wav_path })
    }

    /// Releases one reference. On the final release the entry is evicted and
    /// a generated file is unlinked.
    pub fn release(&self, handle: &NormalizedHandle) {
        let mut remove = false;
        if let Some(mut entry) = self.entries.get_mut(&handle.key) {
            entry.refcount = entry.refcount.saturating_sub(1);
            remove = entry.refcount == 0;
        }
        if remove {
            if let Some((_, entry)) = self.entries.remove(&handle.key) {
                self.locks.remove(&handle.key);
                if entry.generated {
                    if let Err(e) = std::fs::remove_file(&entry.wav_path) {
                        log::debug!(
                            "[Batch] could not remove generated wav {}: {}",
                            entry.wav_path.display(),
                            e
                        );
                    }
                }
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
