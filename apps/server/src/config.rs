//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to (0 = auto-allocate).
    /// Override: `PARLANCE_BIND_PORT`
    pub bind_port: u16,

    /// Directory for persistent data (JSONL stores).
    /// Override: `PARLANCE_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Working directory for uploads and normalized audio.
    /// Override: `PARLANCE_WORK_DIR`
    pub work_dir: Option<PathBuf>,

    /// Maximum concurrent batch workers.
    pub jobs_max_parallel: usize,

    /// Keepalive ping interval for live sockets (ms).
    pub keepalive_ms: u64,

    /// Target sample rate for server-side decoding (Hz).
    pub target_sample_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = parlance_core::Config::default();
        Self {
            bind_port: 0,
            data_dir: None,
            work_dir: None,
            jobs_max_parallel: core.jobs.max_parallel,
            keepalive_ms: core.streaming.keepalive_ms,
            target_sample_rate: core.streaming.target_sample_rate,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PARLANCE_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("PARLANCE_DATA_DIR") {
            if !val.is_empty() {
                self.data_dir = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = std::env::var("PARLANCE_WORK_DIR") {
            if !val.is_empty() {
                self.work_dir = Some(PathBuf::from(val));
            }
        }
    }

    /// Converts to the core library configuration.
    pub fn to_core_config(&self) -> parlance_core::Config {
        let mut config = parlance_core::Config {
            preferred_port: self.bind_port,
            data_dir: self.data_dir.clone(),
            ..Default::default()
        };
        config.jobs.max_parallel = self.jobs_max_parallel.max(1);
        if let Some(work_dir) = &self.work_dir {
            config.jobs.work_dir = work_dir.clone();
        }
        config.streaming.keepalive_ms = self.keepalive_ms;
        config.streaming.target_sample_rate = self.target_sample_rate;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts_to_valid_core_config() {
        let config = ServerConfig::default();
        assert!(config.to_core_config().validate().is_ok());
    }

    #[test]
    fn yaml_overrides_apply() {
        let yaml = "bind_port: 9000\njobs_max_parallel: 2\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.jobs_max_parallel, 2);
        // Unspecified fields keep their defaults.
        assert_eq!(
            config.target_sample_rate,
            parlance_core::Config::default().streaming.target_sample_rate
        );
    }
}
