//! Error types for the dish pipeline engine.
//!
//! Errors fall into two camps. Configuration errors (`ConfigError`,
//! `TemplateError`, `FieldError`) mean the run cannot make progress and are
//! returned from stage calls before anything is submitted. Per-job execution
//! failures never become a `DishError`; they are recorded on the job instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for dish operations.
#[derive(Debug, Error)]
pub enum DishError {
    /// The pipeline configuration is unusable.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A command or path template could not be parsed or resolved.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// A job record field was written incorrectly.
    #[error("{0}")]
    Field(#[from] FieldError),

    /// The cluster backend failed outside of any single submission.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// A stage was called before `Pipeline::start`.
    #[error("Pipeline has not been started; call start() before running stages")]
    NotStarted,

    /// `Pipeline::start` was called twice.
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// The pipeline was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DishError {
    /// Returns true if this error indicates a configuration problem.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Template(_) | Self::Field(_) | Self::NotStarted | Self::AlreadyStarted
        )
    }
}

/// Errors in the pipeline or stage configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The concurrency ceiling must be positive.
    #[error("Invalid concurrency ceiling {0}: must be at least 1")]
    InvalidCeiling(usize),

    /// A resource request is out of range.
    #[error("Invalid resource request: {0}")]
    InvalidResource(String),

    /// The backend identifier is not known.
    #[error("Unknown cluster backend '{0}' (expected 'local' or 'torque')")]
    UnknownBackend(String),

    /// The root working directory does not exist or is not a directory.
    #[error("Working directory '{0}' does not exist or is not a directory")]
    MissingWorkdir(String),

    /// The root working directory cannot be written to.
    #[error("Working directory '{path}' is not writable: {reason}")]
    UnwritableWorkdir {
        /// The offending path.
        path: String,
        /// The underlying IO failure.
        reason: String,
    },

    /// Two different jobs share a description.
    #[error("Duplicate job description '{0}' with differing fields")]
    DuplicateJob(String),

    /// An input job lacks a usable description.
    #[error("Input job #{0} has no string 'description' field")]
    MissingDescription(usize),

    /// The configuration file could not be read.
    #[error("Failed to load configuration from '{path}': {reason}")]
    Load {
        /// The configuration path.
        path: String,
        /// Why loading failed.
        reason: String,
    },
}

/// Errors raised while parsing or expanding a template.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `{` was never closed.
    #[error("Unclosed placeholder at offset {offset} in template '{template}'")]
    Unclosed {
        /// The template text.
        template: String,
        /// Byte offset of the opening brace.
        offset: usize,
    },

    /// A `}` appeared without a matching `{`.
    #[error("Unmatched '}}' at offset {offset} in template '{template}'")]
    Unmatched {
        /// The template text.
        template: String,
        /// Byte offset of the stray brace.
        offset: usize,
    },

    /// A placeholder body is not `name` or `name[index]`.
    #[error("Malformed placeholder '{{{placeholder}}}' in template '{template}'")]
    Malformed {
        /// The template text.
        template: String,
        /// The placeholder body.
        placeholder: String,
    },

    /// The referenced field is not present on the job.
    #[error("Template references missing field '{field}' for job '{job}'")]
    MissingField {
        /// The field name.
        field: String,
        /// The job description.
        job: String,
    },

    /// An index was applied to a scalar field.
    #[error("Field '{field}' of job '{job}' is not a list and cannot be indexed")]
    NotIndexable {
        /// The field name.
        field: String,
        /// The job description.
        job: String,
    },

    /// An index is past the end of a list field.
    #[error("Index {index} out of range for field '{field}' (length {len}) of job '{job}'")]
    IndexOutOfRange {
        /// The field name.
        field: String,
        /// The requested index.
        index: usize,
        /// The list length.
        len: usize,
        /// The job description.
        job: String,
    },
}

/// Errors raised when writing job record fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldError {
    /// A field was re-written with a value of a different type.
    #[error("Field '{field}' of job '{job}' holds a {existing}; refusing to overwrite with a {attempted}")]
    TypeMismatch {
        /// The field name.
        field: String,
        /// The job description.
        job: String,
        /// The stored type.
        existing: &'static str,
        /// The type being written.
        attempted: &'static str,
    },

    /// A core field was written through the extension map.
    #[error("Field '{0}' is reserved and cannot be set directly")]
    Reserved(String),

    /// A map function changed part of the fixed schema.
    #[error("Field '{field}' of job '{job}' is fixed and cannot be changed by a map function")]
    Fixed {
        /// The fixed field that changed.
        field: &'static str,
        /// The job description.
        job: String,
    },
}

/// Errors reported by a cluster backend.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    /// The backend refused the submission.
    #[error("Submission rejected: {0}")]
    SubmitRejected(String),

    /// Querying a submission failed.
    #[error("Poll failed for {handle}: {reason}")]
    PollFailed {
        /// The submission handle.
        handle: String,
        /// Why polling failed.
        reason: String,
    },

    /// The backend no longer knows about a submission and left no result.
    #[error("Submission {0} was lost by the backend")]
    Lost(String),

    /// Cancelling a submission failed.
    #[error("Cancel failed for {handle}: {reason}")]
    CancelFailed {
        /// The submission handle.
        handle: String,
        /// Why cancellation failed.
        reason: String,
    },

    /// Local IO failure while talking to the backend.
    #[error("Backend IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = DishError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_names_job() {
        let err = TemplateError::MissingField {
            field: "fastq1".to_string(),
            job: "sample-7".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("fastq1"));
        assert!(msg.contains("sample-7"));
    }

    #[test]
    fn test_configuration_classification() {
        let err: DishError = ConfigError::InvalidCeiling(0).into();
        assert!(err.is_configuration());

        let err: DishError = BackendError::Lost("42".to_string()).into();
        assert!(!err.is_configuration());

        assert!(DishError::NotStarted.is_configuration());
    }

    #[test]
    fn test_malformed_placeholder_message() {
        let err = TemplateError::Malformed {
            template: "x {a b}".to_string(),
            placeholder: "a b".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed placeholder '{a b}' in template 'x {a b}'");
    }
}
