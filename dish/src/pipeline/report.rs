//! Stage, transaction and pipeline reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::job::{JobFailure, JobRecord, JobStatus};

/// What one `run` or `map` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage label, e.g. `run[3]`.
    pub stage: String,
    /// The command template, for `run` stages.
    pub command: Option<String>,
    /// Jobs that completed the stage.
    pub succeeded: Vec<String>,
    /// Jobs that failed in this stage.
    pub failed: Vec<String>,
    /// Active jobs excluded by an enclosing transaction.
    pub skipped: Vec<String>,
}

impl StageReport {
    pub(crate) fn new(stage: impl Into<String>, command: Option<&str>) -> Self {
        Self {
            stage: stage.into(),
            command: command.map(str::to_string),
            ..Self::default()
        }
    }

    /// Returns true if no job failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of jobs the stage ran for.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub(crate) fn sort(&mut self) {
        self.succeeded.sort();
        self.failed.sort();
        self.skipped.sort();
    }
}

/// Outcome of a transaction block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReport {
    /// Transaction label, e.g. `transaction[0]`.
    pub label: String,
    /// Jobs already complete on entry.
    pub skipped: Vec<String>,
    /// Jobs that ran the block and now satisfy the postcondition.
    pub completed: Vec<String>,
    /// Jobs that ran the block and failed, in a stage or the postcondition.
    pub failed: Vec<String>,
}

impl TransactionReport {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

/// One job's line in the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job description.
    pub description: String,
    /// Final status.
    pub status: JobStatus,
    /// Working directory.
    pub workdir: Option<PathBuf>,
    /// Total submissions across all stages.
    pub submissions: u32,
    /// Last exit status seen.
    pub last_exit_status: Option<i32>,
    /// The failure, if the job failed.
    pub failure: Option<JobFailure>,
}

impl From<&JobRecord> for JobSummary {
    fn from(job: &JobRecord) -> Self {
        Self {
            description: job.description().to_string(),
            status: job.status(),
            workdir: job.workdir().map(Path::to_path_buf),
            submissions: job.submissions(),
            last_exit_status: job.last_exit_status(),
            failure: job.failure().cloned(),
        }
    }
}

/// The state of every job at the end (or middle) of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// Root working directory.
    pub workdir: PathBuf,
    /// Backend name.
    pub backend: String,
    /// Number of jobs.
    pub total: usize,
    /// Jobs not failed.
    pub active: usize,
    /// Jobs failed.
    pub failed: usize,
    /// Per-job summaries, in pipeline order.
    pub jobs: Vec<JobSummary>,
}

impl PipelineReport {
    pub(crate) fn new(workdir: &Path, backend: &str, jobs: &[JobRecord]) -> Self {
        let failed = jobs.iter().filter(|j| j.status() == JobStatus::Failed).count();
        Self {
            generated_at: Utc::now(),
            workdir: workdir.to_path_buf(),
            backend: backend.to_string(),
            total: jobs.len(),
            active: jobs.len() - failed,
            failed,
            jobs: jobs.iter().map(JobSummary::from).collect(),
        }
    }

    /// Returns the failed jobs' summaries.
    pub fn failures(&self) -> impl Iterator<Item = &JobSummary> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    /// Returns true if every job failed; a caller may treat this as a failed run.
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut bad = JobRecord::new("b");
        bad.mark_failed(JobFailure::new("run[0]", "command exited with status 1").with_exit_status(Some(1)));
        let jobs = vec![JobRecord::new("a"), bad];

        let report = PipelineReport::new(Path::new("/w"), "scripted", &jobs);
        assert_eq!(report.total, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.active, 1);
        assert!(!report.all_failed());

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].last_exit_status, Some(1));
        assert_eq!(failures[0].failure.as_ref().unwrap().stage, "run[0]");
    }

    #[test]
    fn test_stage_report_sort() {
        let mut report = StageReport::new("run[0]", Some("echo"));
        report.succeeded = vec!["b".into(), "a".into()];
        report.failed = vec!["c".into()];
        report.sort();
        assert_eq!(report.succeeded, vec!["a", "b"]);
        assert_eq!(report.attempted(), 3);
        assert!(!report.is_clean());
    }
}
