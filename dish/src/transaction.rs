//! Completion conditions for transactions.
//!
//! A transaction names what "done" looks like for a job, either as output
//! files that must exist or as a predicate over the record. The pipeline
//! checks it once on entry, to skip jobs that are already complete, and
//! once on exit, to fail jobs whose stages exited zero without producing
//! their outputs.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::errors::TemplateError;
use crate::job::JobRecord;
use crate::template::Template;

/// A user-supplied completion test.
pub type Predicate = dyn Fn(&JobRecord) -> anyhow::Result<bool> + Send + Sync;

/// Why a completion check could not produce an answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// A target template did not resolve against the job.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// The predicate returned an error.
    #[error("transaction predicate error: {0}")]
    Predicate(String),
}

/// What must hold for a job to count as complete.
#[derive(Clone)]
pub enum Completion {
    /// Every target file must exist, relative to the job's working directory.
    Targets(Vec<Template>),
    /// The predicate must return `true`.
    Predicate(Arc<Predicate>),
}

impl Completion {
    /// A single target file.
    ///
    /// # Errors
    ///
    /// Returns the parse error if the target template is malformed.
    pub fn target(target: &str) -> Result<Self, TemplateError> {
        Ok(Self::Targets(vec![Template::parse(target)?]))
    }

    /// Several target files, all of which must exist.
    ///
    /// # Errors
    ///
    /// Returns the first parse error.
    pub fn targets<I, S>(targets: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        targets
            .into_iter()
            .map(|t| Template::parse(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Targets)
    }

    /// A predicate over the job record.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&JobRecord) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Returns true if `job` is complete.
    ///
    /// An empty target list is trivially satisfied.
    pub fn check(&self, job: &JobRecord) -> Result<bool, CheckError> {
        match self {
            Self::Targets(targets) => {
                for target in targets {
                    let path = job.resolve_path(target.expand(job)?);
                    if !path.exists() {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Predicate(predicate) => predicate(job).map_err(|e| CheckError::Predicate(format!("{e:#}"))),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Targets(targets) => f
                .debug_tuple("Targets")
                .field(&targets.iter().map(Template::source).collect::<Vec<_>>())
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Targets(targets) => {
                let sources: Vec<&str> = targets.iter().map(Template::source).collect();
                write!(f, "targets [{}]", sources.join(", "))
            }
            Self::Predicate(_) => f.write_str("predicate"),
        }
    }
}
