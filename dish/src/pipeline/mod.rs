//! The pipeline orchestrator.
//!
//! This module provides:
//! - `Pipeline`, which owns the jobs, the working-directory layout and the
//!   shared concurrency throttle
//! - Stage calls: `run` (cluster submission) and `map` (in-process)
//! - Scoped blocks: `transaction` and `group`
//! - Stage and pipeline reports
//!
//! Stages are barriers: each call returns only after every eligible job has
//! reached a terminal state for that stage.
//!
//! ```rust,ignore
//! let mut p = Pipeline::new(config, jobs)?;
//! p.start()?;
//!
//! {
//!     let mut tx = p.transaction(Completion::target("{description}.bam")?)?;
//!     tx.run("bowtie2 -x hg38 -1 {fastq[0]} -2 {fastq[1]} > {description}.bam", RunOptions::new().with_cores(8))
//!         .await?;
//! }
//!
//! for job in p.jobs() {
//!     println!("{}: {}", job.description(), job.status());
//! }
//! ```

mod layout;
mod options;
mod report;
mod scope;


pub use layout::job_dir_name;
pub use options::RunOptions;
pub use report::{JobSummary, PipelineReport, StageReport, TransactionReport};
pub use scope::{GroupGuard, TransactionGuard};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{self, ClusterBackend};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{ConfigError, DishError, Result};
use crate::events::{EventSink, LoggingEventSink};
use crate::executor::{execute_units, RetryController, SubmissionUnit, Throttle, UnitStatus};
use crate::job::{JobFailure, JobRecord, JobStatus};
use crate::map::{map_records, MapFn, MapResult};
use crate::template::Template;
use crate::transaction::{CheckError, Completion};
use scope::{Scope, TransactionScope};

/// A set of jobs driven through a sequence of stages.
pub struct Pipeline {
    config: PipelineConfig,
    jobs: Vec<JobRecord>,
    backend: Arc<dyn ClusterBackend>,
    throttle: Throttle,
    events: Arc<dyn EventSink>,
    cancel_token: Arc<CancellationToken>,
    scopes: Vec<Scope>,
    started: bool,
    stage_count: usize,
    transaction_count: usize,
}

impl Pipeline {
    /// Creates a pipeline with the backend named in `config`.
    ///
    /// Identical jobs are collapsed. Two different jobs sharing a
    /// description are a configuration error.
    pub fn new(config: PipelineConfig, jobs: Vec<JobRecord>) -> Result<Self> {
        let backend = backend::from_config(&config);
        Self::with_backend(config, jobs, backend)
    }

    /// Creates a pipeline with an explicit backend.
    pub fn with_backend(
        config: PipelineConfig,
        jobs: Vec<JobRecord>,
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let jobs = dedupe(jobs)?;
        let throttle = Throttle::new(config.ceiling);

        Ok(Self {
            config,
            jobs,
            backend,
            throttle,
            events: Arc::new(LoggingEventSink::default()),
            cancel_token: Arc::new(CancellationToken::new()),
            scopes: Vec::new(),
            started: false,
            stage_count: 0,
            transaction_count: 0,
        })
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Creates every job's working directory and activates the jobs.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` on a second call; a configuration error if the root
    /// working directory is missing or not writable.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DishError::AlreadyStarted);
        }

        let root = layout::prepare_root(&self.config.workdir)?;
        for job in &mut self.jobs {
            let dir = layout::create_job_dir(&root, job.description())?;
            job.set_workdir(dir);
            job.set_status(JobStatus::Active);
        }
        self.started = true;

        info!(
            workdir = %root.display(),
            jobs = self.jobs.len(),
            ceiling = self.config.ceiling,
            backend = self.backend.name(),
            "Pipeline started"
        );
        self.events.try_emit(
            "pipeline.started",
            Some(serde_json::json!({
                "workdir": root,
                "jobs": self.jobs.len(),
                "ceiling": self.config.ceiling,
                "backend": self.backend.name(),
            })),
        );
        Ok(())
    }

    /// Submits `command` once per eligible job and waits for all of them.
    ///
    /// The command is expanded for every job before anything is submitted,
    /// so a template error aborts the stage with no side effects. Per-job
    /// failures are recorded on the job and in the returned report.
    pub async fn run(&mut self, command: &str, options: RunOptions) -> Result<StageReport> {
        self.ensure_runnable()?;
        let resources = options.resources();
        resources.validate()?;
        check_stage_max(options.max)?;
        let template = Template::parse(command)?;

        let ids = self.eligible_jobs();
        let stage = format!("run[{}]", self.stage_count);

        let mut units = Vec::with_capacity(ids.len());
        for &id in &ids {
            let job = &self.jobs[id];
            let expanded = template.expand(job)?;
            let workdir = job
                .workdir()
                .map_or_else(|| self.config.workdir.clone(), Path::to_path_buf);
            units.push((id, SubmissionUnit::new(job.description(), &stage, expanded, resources, workdir)));
        }
        self.stage_count += 1;

        let limit = self.effective_limit(options.max);
        let retries = options.retries.unwrap_or(self.config.retries);
        self.begin_stage(&stage, &ids, Some(template.source()), limit).await;

        let controller = Arc::new(RetryController::new(
            self.backend.clone(),
            self.config.queue.clone(),
            retries,
            self.config.retry.clone(),
            self.config.poll_interval(),
            self.throttle.limiter(limit),
            self.cancel_token.clone(),
            self.events.clone(),
        ));
        let outcomes = execute_units(controller, units).await;

        let mut report = StageReport::new(&stage, Some(template.source()));
        for (id, outcome) in outcomes {
            let job = &mut self.jobs[id];
            job.record_submissions(outcome.attempts, outcome.last_exit_status());

            match outcome.status {
                UnitStatus::Succeeded => {
                    job.set_status(JobStatus::Succeeded);
                    report.succeeded.push(job.description().to_string());
                }
                UnitStatus::Failed | UnitStatus::Cancelled => {
                    let reason = outcome.reason.clone().unwrap_or_default();
                    let reason = if outcome.status == UnitStatus::Cancelled {
                        format!("cancelled: {reason}")
                    } else {
                        reason
                    };
                    let failure = JobFailure::new(&stage, reason)
                        .with_exit_status(outcome.last_exit_status())
                        .with_attempts(outcome.attempts);
                    fail_job(job, failure, self.events.as_ref());
                    report.failed.push(job.description().to_string());
                }
            }
        }

        self.finish_stage(report).await
    }

    /// Applies `function` to every eligible job in-process.
    ///
    /// Calls run concurrently on the blocking pool, bounded by the current
    /// ceiling. An error fails that job only.
    ///
    /// Only extension fields are taken back from the function. Renaming the
    /// job, moving its workdir or changing a field's type fails the job and
    /// leaves its record as it was.
    pub async fn map<F>(&mut self, function: F) -> Result<StageReport>
    where
        F: Fn(&mut JobRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.map_inner(Arc::new(function), None).await
    }

    /// Like [`Pipeline::map`] with a stage-level concurrency limit.
    pub async fn map_limited<F>(&mut self, function: F, max: usize) -> Result<StageReport>
    where
        F: Fn(&mut JobRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.map_inner(Arc::new(function), Some(max)).await
    }

    async fn map_inner(&mut self, function: Arc<MapFn>, max: Option<usize>) -> Result<StageReport> {
        self.ensure_runnable()?;
        check_stage_max(max)?;

        let ids = self.eligible_jobs();
        let stage = format!("map[{}]", self.stage_count);
        self.stage_count += 1;

        let limit = self.effective_limit(max);
        self.begin_stage(&stage, &ids, None, limit).await;

        let records = ids.iter().map(|&id| (id, self.jobs[id].clone())).collect();
        let results = map_records(function, self.throttle.limiter(limit), records).await;

        let mut report = StageReport::new(&stage, None);
        for MapResult { id, record, outcome } in results {
            let job = &mut self.jobs[id];
            let outcome = match job.absorb_fields(record) {
                Ok(()) => outcome,
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(()) => {
                    job.set_status(JobStatus::Succeeded);
                    report.succeeded.push(job.description().to_string());
                }
                Err(reason) => {
                    let failure = JobFailure::new(&stage, format!("map function failed: {reason}"));
                    fail_job(job, failure, self.events.as_ref());
                    report.failed.push(job.description().to_string());
                }
            }
        }

        self.finish_stage(report).await
    }

    /// Opens a transaction block.
    ///
    /// Jobs already satisfying `completion` are skipped by every stage in the
    /// block. The rest run the block and are re-checked when the guard is
    /// dropped or committed; any still unsatisfied are failed with
    /// "transaction postcondition not met".
    ///
    /// # Errors
    ///
    /// Returns a template error, before changing any job, if a target does
    /// not resolve for some eligible job.
    pub fn transaction(&mut self, completion: Completion) -> Result<TransactionGuard<'_>> {
        self.ensure_runnable()?;

        let ids = self.eligible_jobs();
        let mut checks = Vec::with_capacity(ids.len());
        for id in ids {
            match completion.check(&self.jobs[id]) {
                Err(CheckError::Template(e)) => return Err(e.into()),
                check => checks.push((id, check)),
            }
        }

        let label = format!("transaction[{}]", self.transaction_count);
        self.transaction_count += 1;
        let mut scope = TransactionScope::new(label, completion);

        for (id, check) in checks {
            let job = &mut self.jobs[id];
            match check {
                Ok(true) => {
                    debug!(job = %job.description(), transaction = %scope.label, "Already complete; skipping");
                    job.set_status(JobStatus::Skipped);
                    scope.skipped.push(id);
                }
                Ok(false) => scope.participants.push(id),
                Err(e) => fail_job(job, JobFailure::new(&scope.label, e.to_string()), self.events.as_ref()),
            }
        }

        info!(
            transaction = %scope.label,
            completion = %scope.completion,
            skipped = scope.skipped.len(),
            pending = scope.participants.len(),
            "Transaction entered"
        );
        self.events.try_emit(
            "transaction.entered",
            Some(serde_json::json!({
                "transaction": &scope.label,
                "skipped": scope.skipped.len(),
                "pending": scope.participants.len(),
            })),
        );

        let depth = self.scopes.len();
        self.scopes.push(Scope::Transaction(scope));
        Ok(TransactionGuard::new(self, depth))
    }

    /// Opens a block whose stages run with at most `max` units in flight.
    ///
    /// A group can only tighten the ceiling; `max` above the enclosing
    /// ceiling has no effect.
    pub fn group(&mut self, max: usize) -> Result<GroupGuard<'_>> {
        if max == 0 {
            return Err(ConfigError::InvalidCeiling(max).into());
        }
        let depth = self.scopes.len();
        self.scopes.push(Scope::Group { max });
        debug!(max, effective = self.current_ceiling(), "Group entered");
        Ok(GroupGuard::new(self, depth))
    }

    /// Returns every job, including failed ones.
    #[must_use]
    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    /// Looks a job up by description.
    #[must_use]
    pub fn job(&self, description: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.description() == description)
    }

    /// Returns the jobs that have not failed.
    pub fn active_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.is_active())
    }

    /// Returns the failed jobs.
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(|j| j.status() == JobStatus::Failed)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns true once [`Pipeline::start`] has succeeded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns the ceiling in force for the next stage, ignoring `max`.
    #[must_use]
    pub fn current_ceiling(&self) -> usize {
        self.effective_limit(None)
    }

    /// Returns the pipeline-wide throttle, for inspecting in-flight counts.
    #[must_use]
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Returns the token that cancels this pipeline.
    ///
    /// Cancelling it from another task cancels in-flight units; their jobs
    /// fail and every later stage call returns `DishError::Cancelled`.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancel_token.clone()
    }

    /// Cancels the pipeline.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel_token.cancel(reason);
    }

    /// Builds a report of every job's current state.
    #[must_use]
    pub fn report(&self) -> PipelineReport {
        PipelineReport::new(&self.config.workdir, self.backend.name(), &self.jobs)
    }

    /// Writes [`Pipeline::report`] to `path` as pretty-printed JSON.
    pub fn write_report(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.report())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn ensure_runnable(&self) -> Result<()> {
        if !self.started {
            return Err(DishError::NotStarted);
        }
        if let Some(reason) = self.cancel_token.reason() {
            return Err(DishError::Cancelled(reason));
        }
        Ok(())
    }

    /// Jobs that are active and not skipped by an open transaction.
    fn eligible_jobs(&self) -> Vec<usize> {
        let excluded = self.excluded_jobs();
        (0..self.jobs.len())
            .filter(|id| self.jobs[*id].is_active() && !excluded.contains(id))
            .collect()
    }

    fn excluded_jobs(&self) -> HashSet<usize> {
        self.scopes
            .iter()
            .filter_map(|scope| match scope {
                Scope::Transaction(tx) => Some(tx.skipped.iter().copied()),
                Scope::Group { .. } => None,
            })
            .flatten()
            .collect()
    }

    fn effective_limit(&self, max: Option<usize>) -> usize {
        let group = self
            .scopes
            .iter()
            .rev()
            .find_map(|scope| match scope {
                Scope::Group { max: group_max } => Some(*group_max),
                Scope::Transaction(_) => None,
            })
            .unwrap_or(usize::MAX);

        max.unwrap_or(usize::MAX).min(group).min(self.config.ceiling)
    }

    async fn begin_stage(&mut self, stage: &str, ids: &[usize], command: Option<&str>, limit: usize) {
        for &id in ids {
            self.jobs[id].set_status(JobStatus::Running);
        }
        info!(stage = %stage, command = ?command, jobs = ids.len(), limit, "Stage started");
        self.events
            .emit(
                "stage.started",
                Some(serde_json::json!({
                    "stage": stage,
                    "command": command,
                    "jobs": ids.len(),
                    "limit": limit,
                })),
            )
            .await;
    }

    async fn finish_stage(&self, mut report: StageReport) -> Result<StageReport> {
        let excluded = self.excluded_jobs();
        report.skipped = excluded
            .into_iter()
            .filter(|id| self.jobs[*id].is_active())
            .map(|id| self.jobs[id].description().to_string())
            .collect();
        report.sort();

        info!(
            stage = %report.stage,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Stage completed"
        );
        self.events
            .emit("stage.completed", serde_json::to_value(&report).ok())
            .await;
        Ok(report)
    }

    /// Pops scopes down to `depth`, closing each one.
    ///
    /// Returns the report of the scope at `depth` if it is a transaction.
    pub(crate) fn close_scopes(&mut self, depth: usize) -> Option<TransactionReport> {
        let mut report = None;
        while self.scopes.len() > depth {
            let Some(scope) = self.scopes.pop() else { break };
            match scope {
                Scope::Group { max } => {
                    debug!(max, restored = self.current_ceiling(), "Group exited");
                    report = None;
                }
                Scope::Transaction(tx) => report = Some(self.exit_transaction(tx)),
            }
        }
        report
    }

    fn exit_transaction(&mut self, tx: TransactionScope) -> TransactionReport {
        let mut report = TransactionReport::new(&tx.label);

        for &id in &tx.skipped {
            let job = &mut self.jobs[id];
            if job.status() == JobStatus::Skipped {
                job.set_status(JobStatus::Succeeded);
            }
            report.skipped.push(job.description().to_string());
        }

        for &id in &tx.participants {
            let job = &mut self.jobs[id];
            if !job.is_active() {
                report.failed.push(job.description().to_string());
                continue;
            }

            let reason = match tx.completion.check(job) {
                Ok(true) => {
                    report.completed.push(job.description().to_string());
                    continue;
                }
                Ok(false) => "transaction postcondition not met".to_string(),
                Err(e) => format!("transaction postcondition check failed: {e}"),
            };
            fail_job(job, JobFailure::new(&tx.label, reason), self.events.as_ref());
            report.failed.push(job.description().to_string());
        }

        info!(
            transaction = %report.label,
            skipped = report.skipped.len(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Transaction exited"
        );
        self.events.try_emit("transaction.exited", serde_json::to_value(&report).ok());
        report
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("workdir", &self.config.workdir)
            .field("backend", &self.backend.name())
            .field("jobs", &self.jobs.len())
            .field("started", &self.started)
            .field("scopes", &self.scopes.len())
            .finish_non_exhaustive()
    }
}

fn fail_job(job: &mut JobRecord, failure: JobFailure, events: &dyn EventSink) {
    events.try_emit(
        "job.failed",
        Some(serde_json::json!({
            "job": job.description(),
            "stage": &failure.stage,
            "reason": &failure.reason,
            "exit_status": failure.exit_status,
            "attempts": failure.attempts,
        })),
    );
    job.mark_failed(failure);
}

// A stage limit of zero could never admit a unit.
fn check_stage_max(max: Option<usize>) -> Result<(), ConfigError> {
    match max {
        Some(0) => Err(ConfigError::InvalidCeiling(0)),
        _ => Ok(()),
    }
}

fn dedupe(jobs: Vec<JobRecord>) -> Result<Vec<JobRecord>, ConfigError> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<JobRecord> = Vec::with_capacity(jobs.len());

    for job in jobs {
        if let Some(&index) = seen.get(job.description()) {
            if unique[index] == job {
                debug!(job = %job.description(), "Dropping duplicate job");
                continue;
            }
            return Err(ConfigError::DuplicateJob(job.description().to_string()));
        }
        seen.insert(job.description().to_string(), unique.len());
        unique.push(job);
    }
    Ok(unique)
}
