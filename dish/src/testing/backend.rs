//! Scripted in-memory cluster backend.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::backend::{ClusterBackend, SubmissionHandle, SubmissionState};
use crate::errors::BackendError;
use crate::executor::SubmissionUnit;

#[derive(Debug)]
struct LiveUnit {
    unit: SubmissionUnit,
    polls_left: u32,
    exit_status: i32,
}

/// A backend whose outcomes are scripted per job.
///
/// Each job's script is a list of exit statuses, one per attempt; the last
/// entry repeats once the list runs out, and an unscripted job succeeds.
/// Files registered with [`ScriptedBackend::creates`] are written into the
/// unit's working directory when an attempt succeeds.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: DashMap<String, Vec<i32>>,
    creates: DashMap<String, Vec<String>>,
    rejected: DashSet<String>,
    submissions: DashMap<String, u32>,
    live: DashMap<String, LiveUnit>,
    per_job_live: DashMap<String, u32>,
    submitted: Mutex<Vec<SubmissionUnit>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    overlap: AtomicBool,
    next_id: AtomicU64,
    run_polls: u32,
}

impl ScriptedBackend {
    /// Creates a backend where every unit succeeds on first poll.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes each unit report `Running` for this many polls before finishing.
    #[must_use]
    pub fn with_run_polls(mut self, polls: u32) -> Self {
        self.run_polls = polls;
        self
    }

    /// Scripts exit statuses for a job's attempts.
    pub fn script(&self, job: &str, exit_statuses: impl IntoIterator<Item = i32>) {
        self.scripts.insert(job.to_string(), exit_statuses.into_iter().collect());
    }

    /// Registers files (relative to the workdir) written on success.
    pub fn creates(&self, job: &str, files: impl IntoIterator<Item = impl Into<String>>) {
        self.creates
            .insert(job.to_string(), files.into_iter().map(Into::into).collect());
    }

    /// Makes every submission for a job fail with `SubmitRejected`.
    pub fn reject_submissions(&self, job: &str) {
        self.rejected.insert(job.to_string());
    }

    /// Returns the number of submissions made for a job.
    #[must_use]
    pub fn submissions(&self, job: &str) -> u32 {
        self.submissions.get(job).map_or(0, |n| *n)
    }

    /// Returns the total number of submissions across all jobs.
    #[must_use]
    pub fn total_submissions(&self) -> u32 {
        self.submissions.iter().map(|entry| *entry.value()).sum()
    }

    /// Returns every unit submitted, in submission order.
    #[must_use]
    pub fn submitted(&self) -> Vec<SubmissionUnit> {
        self.submitted.lock().clone()
    }

    /// Returns the highest number of units in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns the number of units currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns true if any job ever had two units in flight at once.
    #[must_use]
    pub fn saw_job_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn finish(&self, live: &LiveUnit) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut count) = self.per_job_live.get_mut(&live.unit.job) {
            *count = count.saturating_sub(1);
        }
    }

    fn write_outputs(&self, unit: &SubmissionUnit) -> Result<(), BackendError> {
        if let Some(files) = self.creates.get(&unit.job) {
            for file in files.iter() {
                let path = unit.workdir.join(file);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, b"")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn submit(&self, unit: &SubmissionUnit, _queue: &str) -> Result<SubmissionHandle, BackendError> {
        let attempt = {
            let mut count = self.submissions.entry(unit.job.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.submitted.lock().push(unit.clone());

        if self.rejected.contains(&unit.job) {
            return Err(BackendError::SubmitRejected(format!("{} rejected by script", unit.job)));
        }

        let exit_status = self.scripts.get(&unit.job).map_or(0, |script| {
            let index = usize::try_from(attempt - 1).unwrap_or(usize::MAX);
            script.get(index).or_else(|| script.last()).copied().unwrap_or(0)
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut per_job = self.per_job_live.entry(unit.job.clone()).or_insert(0);
            *per_job += 1;
            if *per_job > 1 {
                self.overlap.store(true, Ordering::SeqCst);
            }
        }

        let id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.insert(
            id.clone(),
            LiveUnit {
                unit: unit.clone(),
                polls_left: self.run_polls,
                exit_status,
            },
        );
        Ok(SubmissionHandle::new(id))
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<SubmissionState, BackendError> {
        {
            let mut live = self
                .live
                .get_mut(handle.as_str())
                .ok_or_else(|| BackendError::Lost(handle.to_string()))?;
            if live.polls_left > 0 {
                live.polls_left -= 1;
                return Ok(SubmissionState::Running);
            }
        }

        let (_, live) = self
            .live
            .remove(handle.as_str())
            .ok_or_else(|| BackendError::Lost(handle.to_string()))?;
        self.finish(&live);

        if live.exit_status == 0 {
            self.write_outputs(&live.unit)?;
        }
        Ok(SubmissionState::from_exit_status(live.exit_status))
    }

    async fn cancel(&self, handle: &SubmissionHandle) -> Result<(), BackendError> {
        if let Some((_, live)) = self.live.remove(handle.as_str()) {
            self.finish(&live);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ResourceRequest;
    use std::path::PathBuf;

    fn unit(job: &str, dir: PathBuf) -> SubmissionUnit {
        SubmissionUnit::new(job, "run[0]", "cmd", ResourceRequest::default(), dir)
    }

    #[tokio::test]
    async fn test_script_repeats_last_status() {
        let backend = ScriptedBackend::new();
        backend.script("a", [1, 2]);

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let handle = backend.submit(&unit("a", PathBuf::from("/w")), "q").await.unwrap();
            statuses.push(backend.poll(&handle).await.unwrap());
        }

        assert_eq!(
            statuses,
            vec![
                SubmissionState::Failed { exit_status: 1 },
                SubmissionState::Failed { exit_status: 2 },
                SubmissionState::Failed { exit_status: 2 },
            ]
        );
        assert_eq!(backend.submissions("a"), 3);
    }

    #[tokio::test]
    async fn test_creates_files_on_success_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new();
        backend.creates("ok", ["out/x.out"]);
        backend.creates("bad", ["y.out"]);
        backend.script("bad", [1]);

        let h = backend.submit(&unit("ok", dir.path().to_path_buf()), "q").await.unwrap();
        backend.poll(&h).await.unwrap();
        let h = backend.submit(&unit("bad", dir.path().to_path_buf()), "q").await.unwrap();
        backend.poll(&h).await.unwrap();

        assert!(dir.path().join("out/x.out").exists());
        assert!(!dir.path().join("y.out").exists());
    }

    #[tokio::test]
    async fn test_tracks_in_flight_and_overlap() {
        let backend = ScriptedBackend::new().with_run_polls(1);
        let a = backend.submit(&unit("a", PathBuf::from("/w")), "q").await.unwrap();
        let _b = backend.submit(&unit("a", PathBuf::from("/w")), "q").await.unwrap();

        assert_eq!(backend.in_flight(), 2);
        assert!(backend.saw_job_overlap());

        assert_eq!(backend.poll(&a).await.unwrap(), SubmissionState::Running);
        assert_eq!(backend.poll(&a).await.unwrap(), SubmissionState::Succeeded);
        assert_eq!(backend.in_flight(), 1);
        assert_eq!(backend.peak_in_flight(), 2);
    }
}
