//! Torque/PBS backend.
//!
//! Units are submitted by piping a generated job script into `qsub`. The
//! script records the command's exit status in a sentinel file, which is
//! what `poll` falls back to once the scheduler has purged a finished job
//! from `qstat`.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::local::LOG_DIR;
use super::{ClusterBackend, SubmissionHandle, SubmissionState};
use crate::errors::BackendError;
use crate::executor::SubmissionUnit;

/// Torque truncates job names past this length.
const MAX_JOB_NAME: usize = 15;

/// The fields of `qstat -f` output the backend cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QstatRecord {
    /// Single-letter job state (`Q`, `R`, `E`, `C`, `H`, ...).
    pub job_state: Option<String>,
    /// Exit status, present once the job completed.
    pub exit_status: Option<i32>,
}

impl QstatRecord {
    /// Converts to a submission state, if the record is conclusive.
    #[must_use]
    pub fn state(&self) -> Option<SubmissionState> {
        match self.job_state.as_deref()? {
            "C" => self.exit_status.map(SubmissionState::from_exit_status),
            "Q" | "H" | "W" | "T" => Some(SubmissionState::Queued),
            _ => Some(SubmissionState::Running),
        }
    }
}

#[allow(clippy::expect_used)]
fn qstat_field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(job_state|exit_status)\s*=\s*(\S+)\s*$").expect("qstat regex is valid")
    })
}

/// Parses `qstat -f <id>` output.
#[must_use]
pub fn parse_qstat(output: &str) -> QstatRecord {
    let mut record = QstatRecord::default();
    for captures in qstat_field_pattern().captures_iter(output) {
        let value = &captures[2];
        match &captures[1] {
            "job_state" => record.job_state = Some(value.to_string()),
            "exit_status" => record.exit_status = value.parse().ok(),
            _ => {}
        }
    }
    record
}

// A quoted directive argument cannot carry `"` or a newline.
fn directive_path(path: &Path) -> Result<String, BackendError> {
    let text = path.display().to_string();
    if text.contains(['"', '\n']) {
        return Err(BackendError::SubmitRejected(format!(
            "path {text:?} cannot be used in a #PBS directive"
        )));
    }
    Ok(format!("\"{text}\""))
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

fn job_name(unit: &SubmissionUnit) -> String {
    let name: String = unit
        .job
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(MAX_JOB_NAME - 2)
        .collect();
    format!("d_{name}")
}

/// Renders the job script handed to `qsub`.
///
/// Paths in `#PBS` directives are double-quoted; a workdir containing `"`
/// or a newline is rejected.
pub fn render_script(unit: &SubmissionUnit, queue: &str, sentinel: &Path) -> Result<String, BackendError> {
    let log_dir = unit.workdir.join(LOG_DIR);
    let stem = format!("{}.{}", unit.stage, unit.attempt);
    Ok(format!(
        "#!/bin/sh\n\
         #PBS -N {name}\n\
         #PBS -q {queue}\n\
         #PBS -l nodes=1:ppn={cores}\n\
         #PBS -l mem={mem}gb\n\
         #PBS -d {workdir}\n\
         #PBS -o {out}\n\
         #PBS -e {err}\n\
         cd {workdir_q} || exit 1\n\
         {command}\n\
         status=$?\n\
         echo $status > {sentinel}\n\
         exit $status\n",
        name = job_name(unit),
        queue = queue,
        cores = unit.resources.cores,
        mem = unit.resources.mem_gb,
        workdir = directive_path(&unit.workdir)?,
        out = directive_path(&log_dir.join(format!("{stem}.out")))?,
        err = directive_path(&log_dir.join(format!("{stem}.err")))?,
        workdir_q = shell_quote(&unit.workdir),
        command = unit.command,
        sentinel = shell_quote(sentinel),
    ))
}

/// Backend that submits to Torque/PBS.
#[derive(Debug)]
pub struct TorqueBackend {
    qsub: String,
    qstat: String,
    qdel: String,
    sentinels: DashMap<String, PathBuf>,
}

impl Default for TorqueBackend {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
            sentinels: DashMap::new(),
        }
    }
}

impl TorqueBackend {
    /// Creates a backend using `qsub`, `qstat` and `qdel` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the scheduler commands, e.g. absolute paths or wrappers.
    #[must_use]
    pub fn with_commands(mut self, qsub: impl Into<String>, qstat: impl Into<String>, qdel: impl Into<String>) -> Self {
        self.qsub = qsub.into();
        self.qstat = qstat.into();
        self.qdel = qdel.into();
        self
    }

    async fn read_sentinel(&self, handle: &SubmissionHandle) -> Result<SubmissionState, BackendError> {
        let sentinel = self
            .sentinels
            .get(handle.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::Lost(handle.to_string()))?;

        match tokio::fs::read_to_string(&sentinel).await {
            Ok(contents) => {
                let exit_status = contents.trim().parse::<i32>().map_err(|e| BackendError::PollFailed {
                    handle: handle.to_string(),
                    reason: format!("bad sentinel {}: {e}", sentinel.display()),
                })?;
                self.sentinels.remove(handle.as_str());
                Ok(SubmissionState::from_exit_status(exit_status))
            }
            Err(_) => Err(BackendError::Lost(handle.to_string())),
        }
    }
}

#[async_trait]
impl ClusterBackend for TorqueBackend {
    fn name(&self) -> &'static str {
        "torque"
    }

    async fn submit(&self, unit: &SubmissionUnit, queue: &str) -> Result<SubmissionHandle, BackendError> {
        let log_dir = unit.workdir.join(LOG_DIR);
        let sentinel = log_dir.join(format!("{}.{}.{}.exit", unit.stage, unit.attempt, Uuid::new_v4()));
        let script = render_script(unit, queue, &sentinel)?;
        tokio::fs::create_dir_all(&log_dir).await?;

        let mut child = Command::new(&self.qsub)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::SubmitRejected(format!("failed to run {}: {e}", self.qsub)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BackendError::SubmitRejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(BackendError::SubmitRejected("qsub returned no job id".to_string()));
        }

        debug!(handle = %id, job = %unit.job, queue = %queue, "Submitted to torque");
        self.sentinels.insert(id.clone(), sentinel);
        Ok(SubmissionHandle::new(id))
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<SubmissionState, BackendError> {
        let output = Command::new(&self.qstat)
            .arg("-f")
            .arg(handle.as_str())
            .output()
            .await
            .map_err(|e| BackendError::PollFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            if let Some(state) = parse_qstat(&String::from_utf8_lossy(&output.stdout)).state() {
                if state.is_terminal() {
                    self.sentinels.remove(handle.as_str());
                }
                return Ok(state);
            }
        }

        // Purged from qstat, or completed without an exit status.
        self.read_sentinel(handle).await
    }

    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError> {
        let output = Command::new(&self.qdel)
            .arg(handle.as_str())
            .output()
            .await
            .map_err(|e| BackendError::CancelFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;
        self.sentinels.remove(handle.as_str());

        if output.status.success() {
            Ok(())
        } else {
            Err(BackendError::CancelFailed {
                handle: handle.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
