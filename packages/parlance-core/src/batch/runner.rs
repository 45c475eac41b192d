//! Batch transcription pipeline.
//!
//! Each input file is prepared once (normalized WAV, decoded PCM, measured
//! duration) and the shared buffer is fanned out to every provider with
//! uniform timing, so per-provider metrics stay comparable. Results persist
//! to the append-only store first and count toward the job only when storage
//! accepted them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::audio::resampler::resample_buffer;
use crate::audio::{decode_file_to_pcm, parse_wav, write_wav, AudioFormat};
use crate::batch::jobs::{BatchJob, BatchOptions, FileResult, JobError, JobStore};
use crate::batch::normalized_cache::{CacheKey, NormalizedAudioCache, NormalizedHandle};
use crate::batch::scoring::score;
use crate::error::{ParlanceError, ProviderError};
use crate::normalize::NormalizationConfig;
use crate::providers::{BatchOpts, ProviderRegistry, SttProvider};
use crate::state::Config;
use crate::storage::jsonl::JsonlStore;
use crate::utils::now_millis_u64;

/// A submitted batch job before execution.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub files: Vec<PathBuf>,
    pub providers: Vec<String>,
    pub lang: String,
    /// Reference transcripts keyed by file name. When present, a file
    /// without an entry is a per-file fatal.
    pub manifest: Option<HashMap<String, String>>,
    pub options: BatchOptions,
    pub normalization: NormalizationConfig,
    /// Delete input files after processing (uploads are temp files).
    pub unlink_inputs: bool,
}

/// Worker-slot allocation for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slots {
    pub effective: usize,
    pub file_concurrency: usize,
    pub provider_concurrency: usize,
}

/// Computes the parallelism model for a job.
pub fn compute_slots(
    cpu_count: usize,
    configured_max: usize,
    provider_count: usize,
    requested_parallel: usize,
) -> Slots {
    let cpu_count = cpu_count.max(1);
    let max_parallel = cpu_count.min(configured_max).max(1);
    let provider_count = provider_count.max(1);
    let requested = requested_parallel.max(1);

    let desired = provider_count * requested;
    let effective = max_parallel.min(provider_count.max(desired));
    let file_concurrency = (effective / provider_count).max(1);
    let provider_concurrency = provider_count.min((max_parallel / file_concurrency).max(1)).max(1);

    Slots {
        effective,
        file_concurrency,
        provider_concurrency,
    }
}

/// Executes batch jobs against the provider registry.
pub struct BatchRunner {
    registry: Arc<ProviderRegistry>,
    jobs: Arc<JobStore>,
    cache: Arc<NormalizedAudioCache>,
    results: Arc<JsonlStore<FileResult>>,
    config: Arc<Config>,
}

impl BatchRunner {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        jobs: Arc<JobStore>,
        cache: Arc<NormalizedAudioCache>,
        results: Arc<JsonlStore<FileResult>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            jobs,
            cache,
            results,
            config,
        }
    }

    /// Creates the job and spawns its driver. Returns the job id.
    pub fn submit(&self, submission: BatchSubmission) -> Result<String, ParlanceError> {
        let providers = self.registry.resolve_list(&submission.providers)?;
        if submission.files.is_empty() {
            return Err(ParlanceError::InvalidRequest("no input files".to_string()));
        }

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let job = BatchJob {
            id: job_id.clone(),
            providers: submission.providers.clone(),
            lang: submission.lang.clone(),
            total: submission.files.len() * providers.len(),
            done: 0,
            failed: 0,
            results: Vec::new(),
            errors: Vec::new(),
            manifest: submission.manifest.clone(),
            options: submission.options.clone(),
            normalization: submission.normalization,
            created_at: now_millis_u64(),
        };
        let entry = self.jobs.insert(job);

        let runner = self.clone_parts();
        tokio::spawn(async move {
            runner.run_job(entry, submission, providers).await;
        });
        Ok(job_id)
    }

    fn clone_parts(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            jobs: Arc::clone(&self.jobs),
            cache: Arc::clone(&self.cache),
            results: Arc::clone(&self.results),
            config: Arc::clone(&self.config),
        }
    }

    async fn run_job(
        self,
        entry: Arc<RwLock<BatchJob>>,
        submission: BatchSubmission,
        providers: Vec<Arc<dyn SttProvider>>,
    ) {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let slots = compute_slots(
            cpu_count,
            self.config.jobs.max_parallel,
            providers.len(),
            submission.options.parallel,
        );
        let job_id = entry.read().id.clone();
        log::info!(
            "[Batch] job {}: {} files x {} providers, slots={:?}",
            job_id,
            submission.files.len(),
            providers.len(),
            slots
        );

        let file_sem = Arc::new(Semaphore::new(slots.file_concurrency));
        let mut handles = Vec::new();
        for path in submission.files.clone() {
            let permit_sem = Arc::clone(&file_sem);
            let runner = self.clone_parts();
            let entry = Arc::clone(&entry);
            let providers = providers.clone();
            let submission = submission.clone();
            let provider_concurrency = slots.provider_concurrency;
            handles.push(tokio::spawn(async move {
                let _permit = permit_sem.acquire().await;
                runner
                    .process_file(entry, &path, &submission, providers, provider_concurrency)
                    .await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("[Batch] job {}: file worker panicked: {}", job_id, e);
            }
        }

        // Terminal guarantee: a panicked worker must not leave the job
        // forever "running" for status pollers.
        let retention_ms = self.config.jobs.retention_ms;
        {
            let mut job = entry.write();
            let accounted = job.done + job.failed;
            if accounted < job.total {
                job.failed += job.total - accounted;
            }
        }
        self.jobs.schedule_eviction(job_id, retention_ms);
    }

    async fn process_file(
        &self,
        entry: Arc<RwLock<BatchJob>>,
        path: &Path,
        submission: &BatchSubmission,
        providers: Vec<Arc<dyn SttProvider>>,
        provider_concurrency: usize,
    ) {
        let provider_count = providers.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        // Manifest match comes first; a miss fails the file for every provider.
        let ref_text = match &submission.manifest {
            Some(manifest) => match manifest.get(&file_name) {
                Some(text) => Some(text.clone()),
                None => {
                    let mut job = entry.write();
                    job.failed += provider_count;
                    job.errors.push(JobError {
                        path: file_name.clone(),
                        provider: None,
                        message: format!("manifest has no entry for {}", file_name),
                    });
                    return;
                }
            },
            None => None,
        };

        let target = AudioFormat::new(
            self.config.streaming.target_sample_rate,
            self.config.streaming.target_channels,
        );
        let prepared = self
            .prepare_file(path, target, submission.options.peak_dbfs)
            .await;
        let (handle, pcm, duration_sec) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let mut job = entry.write();
                job.failed += provider_count;
                job.errors.push(JobError {
                    path: file_name.clone(),
                    provider: None,
                    message: e.to_string(),
                });
                return;
            }
        };

        let provider_sem = Arc::new(Semaphore::new(provider_concurrency));
        let mut tasks = Vec::new();
        for provider in providers {
            let sem = Arc::clone(&provider_sem);
            let entry = Arc::clone(&entry);
            let results = Arc::clone(&self.results);
            let pcm = pcm.clone();
            let file_name = file_name.clone();
            let ref_text = ref_text.clone();
            let submission = submission.clone();
            let target_rate = target.sample_rate;
            let target_channels = target.channels;
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire().await;
                transcribe_one(
                    entry,
                    results,
                    provider,
                    pcm,
                    duration_sec,
                    &file_name,
                    ref_text.as_deref(),
                    &submission,
                    target_rate,
                    target_channels,
                )
                .await;
            }));
        }
        for task in tasks {
            if task.await.is_err() {
                let mut job = entry.write();
                job.failed += 1;
            }
        }

        self.cache.release(&handle);
        if submission.unlink_inputs {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("[Batch] could not unlink {}: {}", path.display(), e);
            }
        }
    }

    /// Prepare-once stage: ensure a normalized WAV and decode it.
    async fn prepare_file(
        &self,
        path: &Path,
        target: AudioFormat,
        peak_dbfs: Option<f64>,
    ) -> Result<(NormalizedHandle, Bytes, f64), ParlanceError> {
        let key = CacheKey::for_file(path, target.sample_rate, target.channels, peak_dbfs)?;
        let work_dir = self.config.jobs.work_dir.clone();
        let source = key.path.clone();

        let handle = self
            .cache
            .acquire(key, || async move {
                ensure_normalized_wav(&source, target, peak_dbfs, &work_dir).await
            })
            .await?;

        let bytes = std::fs::read(&handle.wav_path)
            .map_err(|e| ParlanceError::Storage(e.to_string()))?;
        let parsed = parse_wav(&bytes);
        let (format, range) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.cache.release(&handle);
                return Err(e.into());
            }
        };
        let pcm = Bytes::copy_from_slice(&bytes[range]);
        let duration_sec = pcm.len() as f64 / (2.0 * format.channels as f64 * format.sample_rate as f64);
        if duration_sec <= 0.0 {
            self.cache.release(&handle);
            return Err(ParlanceError::Audio(crate::error::AudioError::DurationUnknown(
                path.display().to_string(),
            )));
        }
        Ok((handle, pcm, duration_sec))
    }
}

/// Runs one provider against the shared prepared buffer.
#[allow(clippy::too_many_arguments)]
async fn transcribe_one(
    entry: Arc<RwLock<BatchJob>>,
    results: Arc<JsonlStore<FileResult>>,
    provider: Arc<dyn SttProvider>,
    pcm: Bytes,
    measured_duration_sec: f64,
    file_name: &str,
    ref_text: Option<&str>,
    submission: &BatchSubmission,
    target_rate: u32,
    target_channels: u16,
) {
    let provider_id = provider.id().to_string();
    let provider_rate = provider.preferred_sample_rate();

    let outcome: Result<FileResult, ProviderError> = async {
        let provider_pcm = resample_buffer(pcm, target_rate, provider_rate, target_channels)
            .map_err(|e| ProviderError::Adapter(e.to_string()))?;

        let started = Instant::now();
        let transcript = provider
            .transcribe_file_from_pcm(
                provider_pcm,
                BatchOpts {
                    lang: submission.lang.clone(),
                    sample_rate: provider_rate,
                    punctuation: Default::default(),
                },
            )
            .await?;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        let duration_sec = transcript.duration_sec.unwrap_or(measured_duration_sec);
        let rtf = if duration_sec > 0.0 {
            processing_time_ms as f64 / (duration_sec * 1000.0)
        } else {
            0.0
        };

        let (cer, wer, normalization_used) = match ref_text {
            Some(reference) => {
                let scored = score(
                    &submission.lang,
                    reference,
                    &transcript.text,
                    submission.normalization,
                );
                (scored.cer, scored.wer, scored.normalization_used)
            }
            None => (None, None, submission.normalization),
        };

        Ok(FileResult {
            job_id: entry.read().id.clone(),
            path: file_name.to_string(),
            provider: provider_id.clone(),
            lang: submission.lang.clone(),
            duration_sec,
            processing_time_ms,
            rtf,
            cer,
            wer,
            latency_ms: None,
            text: transcript.text,
            ref_text: ref_text.map(str::to_string),
            degraded: transcript.degraded,
            created_at: now_millis_u64(),
            normalization_used,
        })
    }
    .await;

    match outcome {
        Ok(result) => match results.append(result.clone()) {
            Ok(()) => {
                let mut job = entry.write();
                job.results.push(result);
                job.done += 1;
            }
            Err(e) => {
                // Keep the result out of memory to mirror storage.
                let mut job = entry.write();
                job.failed += 1;
                job.errors.push(JobError {
                    path: file_name.to_string(),
                    provider: Some(provider_id),
                    message: e.to_string(),
                });
            }
        },
        Err(e) => {
            let mut job = entry.write();
            job.failed += 1;
            job.errors.push(JobError {
                path: file_name.to_string(),
                provider: Some(provider_id),
                message: e.to_string(),
            });
        }
    }
}

/// Produces the normalized WAV for one input.
///
/// Inputs that already are PCM16 WAV in the target format (and need no gain
/// change) are used in place; everything else goes through the codec process
/// and lands as a generated file in the work directory.
async fn ensure_normalized_wav(
    source: &Path,
    target: AudioFormat,
    peak_dbfs: Option<f64>,
    work_dir: &Path,
) -> Result<(PathBuf, bool), ParlanceError> {
    if peak_dbfs.is_none() {
        if let Ok(bytes) = std::fs::read(source) {
            if let Ok((format, _)) = parse_wav(&bytes) {
                if format == target {
                    return Ok((source.to_path_buf(), false));
                }
            }
        }
    }

    let pcm = decode_file_to_pcm(source, target).await?;
    let pcm = match peak_dbfs {
        Some(db) => apply_peak_gain(&pcm, db),
        None => pcm,
    };

    std::fs::create_dir_all(work_dir).map_err(|e| ParlanceError::Storage(e.to_string()))?;
    let out_path = work_dir.join(format!("norm-{}.wav", uuid::Uuid::new_v4().simple()));
    std::fs::write(&out_path, write_wav(target, &pcm))
        .map_err(|e| ParlanceError::Storage(e.to_string()))?;
    Ok((out_path, true))
}

/// Scales PCM16 so the peak sample hits `peak_dbfs` (no-op on silence or
/// when the audio already peaks above the target).
fn apply_peak_gain(pcm: &[u8], peak_dbfs: f64) -> Bytes {
    let samples = pcm.len() / 2;
    let mut max_amp = 0i32;
    for i in 0..samples {
        let s = i16::from_le_bytes([pcm[2 * i], pcm[2 * i + 1]]) as i32;
        max_amp = max_amp.max(s.abs());
    }
    if max_amp == 0 {
        return Bytes::copy_from_slice(pcm);
    }

    let target_amp = 32767.0 * 10f64.powf(peak_dbfs / 20.0);
    let gain = target_amp / max_amp as f64;
    if gain >= 1.0 {
        return Bytes::copy_from_slice(pcm);
    }

    let mut out = vec![0u8; pcm.len()];
    for i in 0..samples {
        let s = i16::from_le_bytes([pcm[2 * i], pcm[2 * i + 1]]) as f64;
        let scaled = (s * gain).clamp(-32768.0, 32767.0) as i16;
        let bytes = scaled.to_le_bytes();
        out[2 * i] = bytes[0];
        out[2 * i + 1] = bytes[1];
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use std::time::Duration;

    #[test]
    fn slots_single_provider_single_request() {
        let slots = compute_slots(8, 8, 1, 1);
        assert_eq!(slots.file_concurrency, 1);
        assert_eq!(slots.provider_concurrency, 1);
    }

    #[test]
    fn slots_three_providers_default_parallel() {
        let slots = compute_slots(8, 8, 3, 1);
        assert_eq!(slots.effective, 3);
        assert_eq!(slots.file_concurrency, 1);
        assert_eq!(slots.provider_concurrency, 3);
    }

    #[test]
    fn slots_scale_files_with_requested_parallelism() {
        let slots = compute_slots(8, 8, 2, 4);
        assert_eq!(slots.effective, 8);
        assert_eq!(slots.file_concurrency, 4);
        assert_eq!(slots.provider_concurrency, 2);
    }

    #[test]
    fn slots_clamp_to_configured_max() {
        let slots = compute_slots(32, 2, 3, 8);
        assert_eq!(slots.effective, 2);
        assert_eq!(slots.file_concurrency, 1);
        assert_eq!(slots.provider_concurrency, 2);
    }

    #[test]
    fn peak_gain_reduces_but_never_amplifies() {
        let mut pcm = Vec::new();
        for _ in 0..100 {
            pcm.extend_from_slice(&16000i16.to_le_bytes());
        }
        // -20 dBFS target amp ≈ 3276: gain applied.
        let quieter = apply_peak_gain(&pcm, -20.0);
        let first = i16::from_le_bytes([quieter[0], quieter[1]]);
        assert!(first < 4000 && first > 2500, "got {first}");

        // 0 dBFS target would require amplification: left untouched.
        let same = apply_peak_gain(&pcm, 0.0);
        assert_eq!(&same[..], &pcm[..]);
    }

    fn runner_with(
        providers: Vec<MockProvider>,
        work_dir: PathBuf,
    ) -> (BatchRunner, Arc<JobStore>, Arc<JsonlStore<FileResult>>) {
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(Arc::new(provider));
        }
        let jobs = Arc::new(JobStore::new());
        let results = Arc::new(JsonlStore::in_memory());
        let config = Arc::new(Config {
            jobs: crate::state::JobsConfig {
                max_parallel: 4,
                retention_ms: 60_000,
                work_dir,
            },
            ..Default::default()
        });
        let runner = BatchRunner::new(
            Arc::new(registry),
            Arc::clone(&jobs),
            Arc::new(NormalizedAudioCache::new()),
            Arc::clone(&results),
            config,
        );
        (runner, jobs, results)
    }

    fn write_fixture_wav(dir: &Path, name: &str, seconds: f64) -> PathBuf {
        let format = AudioFormat::new(16000, 1);
        let frames = (16000.0 * seconds) as usize;
        let mut pcm = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            pcm.extend_from_slice(&(((i % 100) as i16) * 100).to_le_bytes());
        }
        let path = dir.join(name);
        std::fs::write(&path, write_wav(format, &pcm)).unwrap();
        path
    }

    async fn wait_terminal(jobs: &JobStore, id: &str) {
        for _ in 0..200 {
            if let Some(entry) = jobs.get(id) {
                if entry.read().status() == crate::batch::jobs::JobStatus::Completed {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached terminal state");
    }

    #[tokio::test]
    async fn manifest_miss_counts_all_providers_failed() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture_wav(dir.path(), "input.wav", 0.2);
        let (runner, jobs, _results) = runner_with(
            vec![
                MockProvider::named("a"),
                MockProvider::named("b"),
                MockProvider::named("c"),
            ],
            dir.path().join("work"),
        );

        let id = runner
            .submit(BatchSubmission {
                files: vec![file],
                providers: vec!["a".into(), "b".into(), "c".into()],
                lang: "en".into(),
                manifest: Some(HashMap::from([(
                    "other.wav".to_string(),
                    "reference".to_string(),
                )])),
                options: BatchOptions::default(),
                normalization: NormalizationConfig::default(),
                unlink_inputs: false,
            })
            .unwrap();

        wait_terminal(&jobs, &id).await;
        let entry = jobs.get(&id).unwrap();
        let job = entry.read();
        assert_eq!(job.total, 3);
        assert_eq!(job.failed, 3);
        assert_eq!(job.done, 0);
        assert_eq!(job.errors.len(), 1);
        assert!(job.errors[0].message.contains("input.wav"));
    }

    #[tokio::test]
    async fn wav_fixture_runs_through_all_providers() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_fixture_wav(dir.path(), "sample.wav", 0.5);
        let (runner, jobs, results) = runner_with(
            vec![MockProvider::named("a"), MockProvider::named("b")],
            dir.path().join("work"),
        );

        let id = runner
            .submit(BatchSubmission {
                files: vec![file.clone()],
                providers: vec!["a".into(), "b".into()],
                lang: "en".into(),
                manifest: Some(HashMap::from([(
                    "sample.wav".to_string(),
                    "transcript 0".to_string(),
                )])),
                options: BatchOptions::default(),
                normalization: NormalizationConfig::default(),
                unlink_inputs: false,
            })
            .unwrap();

        wait_terminal(&jobs, &id).await;
        let entry = jobs.get(&id).unwrap();
        let job = entry.read();
        assert_eq!(job.done, 2);
        assert_eq!(job.failed, 0);
        assert_eq!(job.results.len(), 2);
        assert_eq!(results.len(), 2);

        for result in &job.results {
            assert!((result.duration_sec - 0.5).abs() < 0.05);
            assert!(result.rtf >= 0.0);
            // Mock echoes the manifest reference exactly.
            assert_eq!(result.wer, Some(0.0));
        }
        // Original input is preserved when unlink_inputs is false.
        assert!(file.exists());
    }

    #[tokio::test]
    async fn missing_file_fails_per_provider_and_job_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, jobs, _results) = runner_with(
            vec![MockProvider::named("a"), MockProvider::named("b")],
            dir.path().join("work"),
        );

        let id = runner
            .submit(BatchSubmission {
                files: vec![dir.path().join("does-not-exist.wav")],
                providers: vec!["a".into(), "b".into()],
                lang: "en".into(),
                manifest: None,
                options: BatchOptions::default(),
                normalization: NormalizationConfig::default(),
                unlink_inputs: false,
            })
            .unwrap();

        wait_terminal(&jobs, &id).await;
        let entry = jobs.get(&id).unwrap();
        let job = entry.read();
        assert_eq!(job.failed, 2);
        assert_eq!(job.done, 0);
    }

    #[test]
    fn unknown_provider_rejected_at_submit() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _jobs, _results) =
            runner_with(vec![MockProvider::named("a")], dir.path().join("work"));
        let err = runner.submit(BatchSubmission {
            files: vec![dir.path().join("x.wav")],
            providers: vec!["nope".into()],
            lang: "en".into(),
            manifest: None,
            options: BatchOptions::default(),
            normalization: NormalizationConfig::default(),
            unlink_inputs: false,
        });
        assert!(err.is_err());
    }
}
