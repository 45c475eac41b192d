//! Core application configuration types.
//!
//! The [`Config`] object is immutable after first load; a reload requires
//! rebuilding the services that hold it.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    backlog_hard_limit, BACKLOG_MAX_DROP_MS, BACKLOG_SOFT_LIMIT, DEFAULT_CHANNELS,
    DEFAULT_CHUNK_MS, DEFAULT_TARGET_SAMPLE_RATE, JOB_RETENTION_MS, KEEPALIVE_INTERVAL_MS,
    MAX_MISSED_PONGS, MIN_REPLAY_DURATION_MS, REALTIME_LOG_MAX_ROWS, REALTIME_LOG_RETENTION_MS,
};

/// Configuration for the per-provider send backlog governor.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct BacklogConfig {
    /// Pending sends at or above which chunks are dropped instead of queued.
    pub soft_limit: usize,

    /// Pending sends at which the provider is failed outright.
    pub hard_limit: usize,

    /// Total dropped audio tolerated before the provider is failed (ms).
    pub max_drop_ms: f64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            soft_limit: BACKLOG_SOFT_LIMIT,
            hard_limit: backlog_hard_limit(BACKLOG_SOFT_LIMIT),
            max_drop_ms: BACKLOG_MAX_DROP_MS,
        }
    }
}

impl BacklogConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.soft_limit == 0 {
            return Err("backlog soft_limit must be >= 1".to_string());
        }
        if self.hard_limit <= self.soft_limit {
            return Err("backlog hard_limit must exceed soft_limit".to_string());
        }
        if self.max_drop_ms <= 0.0 {
            return Err("backlog max_drop_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Configuration for live streaming sessions.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    /// Target sample rate for the server-side decode path (Hz).
    pub target_sample_rate: u32,

    /// Channel count on the decode path.
    pub target_channels: u16,

    /// Chunk interval for PCM read from the codec process (ms).
    pub chunk_ms: u32,

    /// Interval between server keepalive pings (ms).
    pub keepalive_ms: u64,

    /// Unanswered pings tolerated before the session is failed.
    pub max_missed_pongs: u32,

    /// Minimum decoded audio for a replay session (ms).
    pub min_replay_duration_ms: u32,

    /// Backlog governor thresholds.
    pub backlog: BacklogConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
            target_channels: DEFAULT_CHANNELS,
            chunk_ms: DEFAULT_CHUNK_MS,
            keepalive_ms: KEEPALIVE_INTERVAL_MS,
            max_missed_pongs: MAX_MISSED_PONGS,
            min_replay_duration_ms: MIN_REPLAY_DURATION_MS,
            backlog: BacklogConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_sample_rate == 0 {
            return Err("target_sample_rate must be >= 1".to_string());
        }
        if !(1..=2).contains(&self.target_channels) {
            return Err("target_channels must be 1 or 2".to_string());
        }
        if self.chunk_ms == 0 {
            return Err("chunk_ms must be >= 1".to_string());
        }
        if self.keepalive_ms == 0 {
            return Err("keepalive_ms must be >= 1".to_string());
        }
        self.backlog.validate()
    }
}

/// Configuration for the batch job runner.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    /// Upper bound on concurrent batch workers across all jobs.
    pub max_parallel: usize,

    /// How long a terminal job stays queryable in memory (ms).
    pub retention_ms: u64,

    /// Directory for uploaded inputs and normalized-audio temp files.
    pub work_dir: std::path::PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            retention_ms: JOB_RETENTION_MS,
            work_dir: std::env::temp_dir().join("parlance-jobs"),
        }
    }
}

impl JobsConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel == 0 {
            return Err("jobs max_parallel must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Retention policy for an append-only store.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RetentionConfig {
    /// Rows older than this are pruned (ms). 0 disables age pruning.
    pub retention_ms: u64,

    /// Maximum rows kept; oldest beyond this are pruned. 0 disables.
    pub max_rows: usize,

    /// Interval between prune passes (ms).
    pub prune_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_ms: REALTIME_LOG_RETENTION_MS,
            max_rows: REALTIME_LOG_MAX_ROWS,
            prune_interval_ms: 60 * 60 * 1000,
        }
    }
}

/// Configuration for the Parlance server.
///
/// All fields have sensible defaults. The object is treated as immutable
/// after services are constructed.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    pub preferred_port: u16,

    /// Data directory for JSONL stores. `None` keeps stores in-memory only.
    pub data_dir: Option<std::path::PathBuf>,

    /// Live streaming configuration.
    pub streaming: StreamingConfig,

    /// Batch job configuration.
    pub jobs: JobsConfig,

    /// Retention for the realtime transcript log.
    pub realtime_log: RetentionConfig,

    /// Retention for batch file results / job history.
    pub history: RetentionConfig,
}

impl Config {
    /// Validates all sub-configurations.
    pub fn validate(&self) -> Result<(), String> {
        self.streaming.validate()?;
        self.jobs.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn backlog_rejects_inverted_limits() {
        let cfg = BacklogConfig {
            soft_limit: 8,
            hard_limit: 8,
            max_drop_ms: 1000.0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backlog_default_matches_derivation() {
        let cfg = BacklogConfig::default();
        assert_eq!(cfg.soft_limit, 8);
        assert_eq!(cfg.hard_limit, 32);
    }

    #[test]
    fn streaming_rejects_bad_channels() {
        let cfg = StreamingConfig {
            target_channels: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
