//! Job status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job.
///
/// ```text
/// pending -> active -> (skipped | running -> succeeded | running -> failed)
/// ```
///
/// `Skipped` and `Succeeded` are still active overall; only `Failed` is
/// terminal and removes the job from every later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job has been configured but the pipeline has not started.
    #[default]
    Pending,
    /// Working directory exists; waiting for the next stage.
    Active,
    /// A transaction pre-check found the job's work already done.
    Skipped,
    /// A unit of work for the job is in flight.
    Running,
    /// The most recent stage completed for this job.
    Succeeded,
    /// A stage failed permanently for this job.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Returns true if the job can still take part in stages.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Skipped | Self::Running | Self::Succeeded)
    }

    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}
