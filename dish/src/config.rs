//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::errors::ConfigError;
use crate::executor::RetryPolicy;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `DISH_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// Everything a pipeline needs besides its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root working directory; each job gets a subdirectory.
    pub workdir: PathBuf,
    /// Global ceiling on units in flight.
    pub ceiling: usize,
    /// Cluster backend.
    #[serde(default)]
    pub backend: BackendKind,
    /// Queue to submit to.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Default number of re-submissions after a failed attempt.
    #[serde(default)]
    pub retries: u32,
    /// How often in-flight units are polled, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay policy between re-submissions.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Capture command stdout/stderr under each job's `.dish/` directory.
    #[serde(default)]
    pub capture_output: bool,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_queue() -> String {
    "batch".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl PipelineConfig {
    /// Creates a configuration from the four values every pipeline names.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownBackend` for an unrecognised backend.
    pub fn new(
        workdir: impl Into<PathBuf>,
        ceiling: usize,
        backend: &str,
        queue: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            workdir: workdir.into(),
            ceiling,
            backend: backend.parse()?,
            queue: queue.into(),
            retries: 0,
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryPolicy::default(),
            capture_output: false,
            log: LogConfig::default(),
        })
    }

    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Load {
            path: "<string>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_error = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| load_error(e.to_string()))
    }

    /// Sets the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the default retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Sets the delay policy between re-submissions.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Enables or disables output capture.
    #[must_use]
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks values that can be verified without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ceiling == 0 {
            return Err(ConfigError::InvalidCeiling(self.ceiling));
        }
        Ok(())
    }
}
