//! The per-dataset job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::JobStatus;
use crate::errors::{ConfigError, FieldError};

/// Names that live in the record's fixed schema rather than the field map.
pub const RESERVED_FIELDS: &[&str] = &["description", "workdir"];

/// A value stored in a job's extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string, usually a path or a name.
    Str(String),
    /// A list of strings, indexable from templates.
    List(Vec<String>),
}

impl FieldValue {
    /// Returns the name of the value's type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list value, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the value as a float, if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            _ => None,
        }
    }
}

/// Scalars render as themselves; lists render space-separated.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => f.write_str(&items.join(" ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&Path> for FieldValue {
    fn from(p: &Path) -> Self {
        Self::Str(p.display().to_string())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(items: Vec<&str>) -> Self {
        Self::List(items.into_iter().map(str::to_string).collect())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Why and where a job stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// The stage that failed.
    pub stage: String,
    /// Human-readable reason.
    pub reason: String,
    /// Last exit status observed from the backend, if any.
    pub exit_status: Option<i32>,
    /// Submission attempts made in the failing stage.
    pub attempts: u32,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

impl JobFailure {
    /// Creates a failure record stamped with the current time.
    #[must_use]
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
            exit_status: None,
            attempts: 0,
            failed_at: Utc::now(),
        }
    }

    /// Sets the last exit status.
    #[must_use]
    pub fn with_exit_status(mut self, exit_status: Option<i32>) -> Self {
        self.exit_status = exit_status;
        self
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// One dataset's configuration and scratchpad.
///
/// The fixed schema holds the description, working directory and status.
/// Everything discovered or derived by stages goes into the typed field map,
/// which only ever grows: fields can be rewritten with a value of the same
/// type but never removed or changed to another type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    description: String,
    workdir: Option<PathBuf>,
    status: JobStatus,
    fields: BTreeMap<String, FieldValue>,
    failure: Option<JobFailure>,
    last_exit_status: Option<i32>,
    submissions: u32,
}

impl JobRecord {
    /// Creates a new job with the given description.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            workdir: None,
            status: JobStatus::Pending,
            fields: BTreeMap::new(),
            failure: None,
            last_exit_status: None,
            submissions: 0,
        }
    }

    /// Adds a field during construction.
    ///
    /// Reserved names are ignored; use [`JobRecord::set`] when the outcome
    /// matters.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let name = name.into();
        if !RESERVED_FIELDS.contains(&name.as_str()) {
            self.fields.insert(name, value.into());
        }
        self
    }

    /// Builds a job from a JSON object such as a discovery manifest entry.
    ///
    /// `index` is only used for error messages.
    pub fn from_json_object(
        index: usize,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        let description = object
            .get("description")
            .and_then(serde_json::Value::as_str)
            .ok_or(ConfigError::MissingDescription(index))?;

        let mut job = Self::new(description);
        for (key, value) in object {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            match FieldValue::from_json(value) {
                Some(field) => {
                    job.fields.insert(key.clone(), field);
                }
                None => tracing::warn!(
                    job = %description,
                    field = %key,
                    "Ignoring input field with unsupported type"
                ),
            }
        }
        Ok(job)
    }

    /// Returns the job description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the job's working directory once the pipeline has started.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Returns true if the job has not failed and has been started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Returns the failure record, if the job failed.
    #[must_use]
    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    /// Returns the last exit status reported by the backend.
    #[must_use]
    pub fn last_exit_status(&self) -> Option<i32> {
        self.last_exit_status
    }

    /// Returns the total number of submissions made for this job.
    #[must_use]
    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    /// Returns an extension field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns an extension field as a string slice.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }

    /// Returns all extension fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Looks a name up across the fixed schema and the extension map.
    ///
    /// This is what templates resolve against, so `{description}` and
    /// `{workdir}` work alongside stage-contributed fields.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<FieldValue> {
        match name {
            "description" => Some(FieldValue::Str(self.description.clone())),
            "workdir" => self.workdir.as_deref().map(FieldValue::from),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Sets an extension field.
    ///
    /// # Errors
    ///
    /// Returns `FieldError::Reserved` for core field names, and
    /// `FieldError::TypeMismatch` if the field already holds another type.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Result<(), FieldError> {
        let name = name.into();
        let value = value.into();

        if RESERVED_FIELDS.contains(&name.as_str()) {
            return Err(FieldError::Reserved(name));
        }

        self.check_type(&name, &value)?;
        self.fields.insert(name, value);
        Ok(())
    }

    fn check_type(&self, name: &str, value: &FieldValue) -> Result<(), FieldError> {
        match self.fields.get(name) {
            Some(existing) if std::mem::discriminant(existing) != std::mem::discriminant(value) => {
                Err(FieldError::TypeMismatch {
                    field: name.to_string(),
                    job: self.description.clone(),
                    existing: existing.type_name(),
                    attempted: value.type_name(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Takes the extension fields of a copy a map function worked on.
    ///
    /// Status, failure and submission counters stay as recorded here. Fields
    /// missing from `updated` are kept. Nothing is applied if `updated`
    /// renamed the job, moved its workdir or changed a field's type.
    pub(crate) fn absorb_fields(&mut self, updated: Self) -> Result<(), FieldError> {
        if updated.description != self.description {
            return Err(FieldError::Fixed {
                field: "description",
                job: self.description.clone(),
            });
        }
        if updated.workdir != self.workdir {
            return Err(FieldError::Fixed {
                field: "workdir",
                job: self.description.clone(),
            });
        }
        for (name, value) in &updated.fields {
            self.check_type(name, value)?;
        }

        self.fields.extend(updated.fields);
        Ok(())
    }

    /// Resolves a path against the job's working directory.
    ///
    /// Absolute paths are returned unchanged.
    #[must_use]
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.workdir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub(crate) fn set_workdir(&mut self, workdir: PathBuf) {
        self.workdir = Some(workdir);
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        // Failed is terminal.
        if self.status != JobStatus::Failed {
            self.status = status;
        }
    }

    pub(crate) fn record_submissions(&mut self, attempts: u32, last_exit_status: Option<i32>) {
        self.submissions += attempts;
        if last_exit_status.is_some() {
            self.last_exit_status = last_exit_status;
        }
    }

    /// Marks the job failed. Only the first failure is kept.
    pub(crate) fn mark_failed(&mut self, failure: JobFailure) {
        if self.status == JobStatus::Failed {
            return;
        }
        if failure.exit_status.is_some() {
            self.last_exit_status = failure.exit_status;
        }
        tracing::warn!(
            job = %self.description,
            stage = %failure.stage,
            reason = %failure.reason,
            exit_status = ?failure.exit_status,
            "Job failed"
        );
        self.status = JobStatus::Failed;
        self.failure = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_and_lookup() {
        let mut job = JobRecord::new("sample-1").with_field("tarball", "a.tar.gz");
        job.set("fastq1", "r1.fastq").unwrap();

        assert_eq!(job.get_str("tarball"), Some("a.tar.gz"));
        assert_eq!(job.lookup("fastq1"), Some(FieldValue::from("r1.fastq")));
        assert_eq!(job.lookup("description"), Some(FieldValue::from("sample-1")));
        assert_eq!(job.lookup("workdir"), None);
    }

    #[test]
    fn test_overwrite_same_type_allowed() {
        let mut job = JobRecord::new("s");
        job.set("inner_dist", 150).unwrap();
        job.set("inner_dist", 175).unwrap();
        assert_eq!(job.field("inner_dist"), Some(&FieldValue::Int(175)));
    }

    #[test]
    fn test_overwrite_different_type_rejected() {
        let mut job = JobRecord::new("s");
        job.set("fastqs", vec!["a.fastq", "b.fastq"]).unwrap();

        let err = job.set("fastqs", "a.fastq").unwrap_err();
        assert_eq!(
            err,
            FieldError::TypeMismatch {
                field: "fastqs".to_string(),
                job: "s".to_string(),
                existing: "list",
                attempted: "string",
            }
        );
        assert_eq!(job.field("fastqs").unwrap().as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let mut job = JobRecord::new("s");
        assert_eq!(
            job.set("workdir", "/tmp"),
            Err(FieldError::Reserved("workdir".to_string()))
        );
        assert!(job.set("description", "other").is_err());
    }

    #[test]
    fn test_from_json_object() {
        let value = serde_json::json!({
            "description": "liver-3",
            "tarball": "/data/liver-3/reads.tar.gz",
            "lanes": ["L001", "L002"],
            "read_length": 100,
        });
        let job = JobRecord::from_json_object(0, value.as_object().unwrap()).unwrap();

        assert_eq!(job.description(), "liver-3");
        assert_eq!(job.get_str("tarball"), Some("/data/liver-3/reads.tar.gz"));
        assert_eq!(job.field("read_length"), Some(&FieldValue::Int(100)));
        assert!(job.field("description").is_none());
    }

    #[test]
    fn test_from_json_object_requires_description() {
        let value = serde_json::json!({ "tarball": "x.tar.gz" });
        let err = JobRecord::from_json_object(4, value.as_object().unwrap()).unwrap_err();
        assert_eq!(err, ConfigError::MissingDescription(4));
    }

    #[test]
    fn test_resolve_path() {
        let mut job = JobRecord::new("s");
        job.set_workdir(PathBuf::from("/work/s"));

        assert_eq!(job.resolve_path("x.out"), PathBuf::from("/work/s/x.out"));
        assert_eq!(job.resolve_path("/abs/y"), PathBuf::from("/abs/y"));
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut job = JobRecord::new("s");
        job.set_status(JobStatus::Active);
        job.mark_failed(JobFailure::new("run[0]", "exit").with_exit_status(Some(2)));
        job.mark_failed(JobFailure::new("run[1]", "later"));
        job.set_status(JobStatus::Succeeded);

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.failure().unwrap().stage, "run[0]");
        assert_eq!(job.last_exit_status(), Some(2));
    }

    #[test]
    fn test_absorb_fields_keeps_fixed_schema() {
        let mut job = JobRecord::new("s").with_field("tarball", "s.tar.gz");
        job.set_workdir(PathBuf::from("/work/s"));
        job.set_status(JobStatus::Running);

        let mut copy = job.clone();
        copy.set("inner_dist", 150).unwrap();
        copy.set_status(JobStatus::Failed);
        job.absorb_fields(copy).unwrap();

        assert_eq!(job.field("inner_dist"), Some(&FieldValue::Int(150)));
        assert_eq!(job.get_str("tarball"), Some("s.tar.gz"));
        assert_eq!(job.status(), JobStatus::Running);
    }

    #[test]
    fn test_absorb_fields_rejects_replaced_record() {
        let mut job = JobRecord::new("s").with_field("tarball", "s.tar.gz");
        job.set_workdir(PathBuf::from("/work/s"));

        let renamed = JobRecord::new("zzz");
        assert_eq!(
            job.absorb_fields(renamed),
            Err(FieldError::Fixed { field: "description", job: "s".to_string() })
        );

        let unplaced = JobRecord::new("s").with_field("tarball", "s.tar.gz");
        assert_eq!(
            job.absorb_fields(unplaced),
            Err(FieldError::Fixed { field: "workdir", job: "s".to_string() })
        );

        let mut retyped = JobRecord::new("s").with_field("tarball", 5).with_field("extra", 1);
        retyped.set_workdir(PathBuf::from("/work/s"));
        assert!(matches!(
            job.absorb_fields(retyped),
            Err(FieldError::TypeMismatch { .. })
        ));
        assert_eq!(job.get_str("tarball"), Some("s.tar.gz"));
        assert!(job.field("extra").is_none());
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::from(vec!["a", "b"]).to_string(), "a b");
        assert_eq!(FieldValue::Int(7).to_string(), "7");
        assert_eq!(FieldValue::Float(1.5).to_string(), "1.5");
    }
}
