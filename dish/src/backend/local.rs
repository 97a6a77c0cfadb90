//! Local process backend.
//!
//! Runs each unit as `sh -c <command>` in the job's working directory.
//! Resource requests are recorded in logs only; throttling is the only
//! admission control.

use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;
use uuid::Uuid;

use super::{ClusterBackend, SubmissionHandle, SubmissionState};
use crate::errors::BackendError;
use crate::executor::SubmissionUnit;

/// Directory under each job's workdir holding captured output.
pub const LOG_DIR: &str = ".dish";

/// Backend that runs commands as child processes.
#[derive(Debug, Default)]
pub struct LocalBackend {
    children: DashMap<String, Child>,
    capture_output: bool,
}

impl LocalBackend {
    /// Creates a backend that discards command output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes stdout/stderr to `<workdir>/.dish/<stage>.<attempt>.{out,err}`.
    #[must_use]
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Returns the number of children not yet reaped.
    #[must_use]
    pub fn running(&self) -> usize {
        self.children.len()
    }

    async fn output_streams(&self, unit: &SubmissionUnit) -> Result<(Stdio, Stdio), BackendError> {
        if !self.capture_output {
            return Ok((Stdio::null(), Stdio::null()));
        }

        let dir = unit.workdir.join(LOG_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let stem = format!("{}.{}", unit.stage, unit.attempt);
        let out = std::fs::File::create(dir.join(format!("{stem}.out")))?;
        let err = std::fs::File::create(dir.join(format!("{stem}.err")))?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }
}

#[async_trait]
impl ClusterBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, unit: &SubmissionUnit, _queue: &str) -> Result<SubmissionHandle, BackendError> {
        let (stdout, stderr) = self.output_streams(unit).await?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&unit.command)
            .current_dir(&unit.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::SubmitRejected(format!("failed to spawn: {e}")))?;

        let handle = SubmissionHandle::new(Uuid::new_v4().to_string());
        debug!(
            handle = %handle,
            job = %unit.job,
            cores = unit.resources.cores,
            mem_gb = unit.resources.mem_gb,
            "Spawned local process"
        );
        self.children.insert(handle.as_str().to_string(), child);
        Ok(handle)
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<SubmissionState, BackendError> {
        let status = {
            let mut child = self
                .children
                .get_mut(handle.as_str())
                .ok_or_else(|| BackendError::Lost(handle.to_string()))?;
            child.try_wait().map_err(|e| BackendError::PollFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?
        };

        match status {
            None => Ok(SubmissionState::Running),
            Some(status) => {
                self.children.remove(handle.as_str());
                // Killed by a signal: report it the way shells do.
                let exit_status = status.code().unwrap_or(128);
                Ok(SubmissionState::from_exit_status(exit_status))
            }
        }
    }

    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError> {
        if let Some((_, mut child)) = self.children.remove(handle.as_str()) {
            child.start_kill().map_err(|e| BackendError::CancelFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
