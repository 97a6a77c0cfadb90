//! Submission units and their outcomes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ConfigError;

/// Resources requested for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU cores.
    pub cores: u32,
    /// Memory in gigabytes.
    pub mem_gb: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self { cores: 1, mem_gb: 1 }
    }
}

impl ResourceRequest {
    /// Creates a resource request.
    #[must_use]
    pub fn new(cores: u32, mem_gb: u32) -> Self {
        Self { cores, mem_gb }
    }

    /// Checks that the request is satisfiable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cores == 0 {
            return Err(ConfigError::InvalidResource("cores must be at least 1".to_string()));
        }
        if self.mem_gb == 0 {
            return Err(ConfigError::InvalidResource("mem must be at least 1 GB".to_string()));
        }
        Ok(())
    }
}

/// One batch submission of one job's command for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionUnit {
    /// Description of the owning job.
    pub job: String,
    /// Stage label, e.g. `run[2]`.
    pub stage: String,
    /// Fully expanded command line.
    pub command: String,
    /// Requested resources.
    pub resources: ResourceRequest,
    /// Directory the command runs in.
    pub workdir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl SubmissionUnit {
    /// Creates the first attempt of a unit.
    #[must_use]
    pub fn new(
        job: impl Into<String>,
        stage: impl Into<String>,
        command: impl Into<String>,
        resources: ResourceRequest,
        workdir: PathBuf,
    ) -> Self {
        Self {
            job: job.into(),
            stage: stage.into(),
            command: command.into(),
            resources,
            workdir,
            attempt: 1,
        }
    }

    /// Returns a fresh unit for the next attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Terminal status of a unit after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// An attempt exited zero.
    Succeeded,
    /// Every attempt failed.
    Failed,
    /// The pipeline was cancelled while the unit was pending or in flight.
    Cancelled,
}

/// What happened to a unit across all its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOutcome {
    /// Terminal status.
    pub status: UnitStatus,
    /// Number of attempts made.
    pub attempts: u32,
    /// Exit status of each failed attempt (`None` for backend faults).
    pub exit_statuses: Vec<Option<i32>>,
    /// Reason for the final failure or cancellation.
    pub reason: Option<String>,
}

impl UnitOutcome {
    pub(crate) fn succeeded(attempts: u32, exit_statuses: Vec<Option<i32>>) -> Self {
        Self {
            status: UnitStatus::Succeeded,
            attempts,
            exit_statuses,
            reason: None,
        }
    }

    pub(crate) fn failed(attempts: u32, exit_statuses: Vec<Option<i32>>, reason: String) -> Self {
        Self {
            status: UnitStatus::Failed,
            attempts,
            exit_statuses,
            reason: Some(reason),
        }
    }

    pub(crate) fn cancelled(attempts: u32, exit_statuses: Vec<Option<i32>>, reason: String) -> Self {
        Self {
            status: UnitStatus::Cancelled,
            attempts,
            exit_statuses,
            reason: Some(reason),
        }
    }

    /// Returns the last exit status the backend reported, if any.
    #[must_use]
    pub fn last_exit_status(&self) -> Option<i32> {
        self.exit_statuses.iter().rev().find_map(|status| *status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_validation() {
        assert!(ResourceRequest::default().validate().is_ok());
        assert!(ResourceRequest::new(8, 8).validate().is_ok());
        assert!(matches!(
            ResourceRequest::new(0, 8).validate(),
            Err(ConfigError::InvalidResource(_))
        ));
        assert!(ResourceRequest::new(1, 0).validate().is_err());
    }

    #[test]
    fn test_next_attempt_keeps_command() {
        let unit = SubmissionUnit::new("s", "run[0]", "echo hi", ResourceRequest::default(), PathBuf::from("/w"));
        let next = unit.next_attempt();
        assert_eq!(next.attempt, 2);
        assert_eq!(next.command, "echo hi");
        assert_eq!(unit.attempt, 1);
    }

    #[test]
    fn test_last_exit_status_skips_faults() {
        let outcome = UnitOutcome::failed(3, vec![Some(1), Some(2), None], "lost".to_string());
        assert_eq!(outcome.last_exit_status(), Some(2));
    }
}
