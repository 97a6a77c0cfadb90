//! Cluster backends.
//!
//! The engine talks to a batch-queue system through three operations:
//! submit, poll and cancel. Timeouts and queueing policy belong to the
//! backend; the engine only observes terminal exit status.

mod local;
mod torque;

pub use local::LocalBackend;
pub use torque::{parse_qstat, render_script, QstatRecord, TorqueBackend};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::errors::{BackendError, ConfigError};
use crate::executor::SubmissionUnit;

/// Opaque identifier the backend returns from `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionHandle(String);

impl SubmissionHandle {
    /// Wraps a backend identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the backend identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a submission as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    /// Accepted but not yet running.
    Queued,
    /// Running.
    Running,
    /// Exited zero.
    Succeeded,
    /// Exited non-zero.
    Failed {
        /// The exit status.
        exit_status: i32,
    },
}

impl SubmissionState {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    /// Maps an exit status to a terminal state.
    #[must_use]
    pub fn from_exit_status(exit_status: i32) -> Self {
        if exit_status == 0 {
            Self::Succeeded
        } else {
            Self::Failed { exit_status }
        }
    }
}

/// The batch-queue contract the engine needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Returns a short backend name for logs.
    fn name(&self) -> &'static str;

    /// Submits a unit to `queue`.
    async fn submit(&self, unit: &SubmissionUnit, queue: &str) -> Result<SubmissionHandle, BackendError>;

    /// Reports the current state of a submission.
    async fn poll(&self, handle: &SubmissionHandle) -> Result<SubmissionState, BackendError>;

    /// Cancels a submission. Cancelling a finished submission is not an error.
    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError>;
}

/// Which backend a pipeline submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Run commands as local processes.
    #[default]
    Local,
    /// Submit to Torque/PBS with qsub.
    #[serde(alias = "pbs")]
    Torque,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Torque => write!(f, "torque"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "torque" | "pbs" => Ok(Self::Torque),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// Builds the backend a configuration names.
#[must_use]
pub fn from_config(config: &PipelineConfig) -> Arc<dyn ClusterBackend> {
    match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new().with_capture_output(config.capture_output)),
        BackendKind::Torque => Arc::new(TorqueBackend::new()),
    }
}
