//! Batch transcription: job bookkeeping, audio preparation, fan-out, scoring.

pub mod jobs;
pub mod normalized_cache;
pub mod runner;
pub mod scoring;

pub use jobs::{BatchJob, BatchOptions, FileResult, JobError, JobStatus, JobStore};
pub use normalized_cache::{CacheKey, NormalizedAudioCache, NormalizedHandle};
pub use runner::{compute_slots, BatchRunner, BatchSubmission, Slots};
pub use scoring::{cer, score, wer, ScoreOutcome};
