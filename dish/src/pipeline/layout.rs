//! Working-directory layout.
//!
//! Every job gets `<root>/<name>`, where `name` is derived from the job's
//! description alone so that a re-run finds the same directory and its
//! transaction targets.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

const SUFFIX_LEN: usize = 8;
const MAX_NAME_LEN: usize = 120;

/// Returns the directory name for a job description.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, and a leading `.` is
/// replaced. If that changed anything, a short sha256 suffix of the original
/// description is appended so that distinct descriptions stay distinct.
#[must_use]
pub fn job_dir_name(description: &str) -> String {
    let mut name: String = description
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.starts_with('.') {
        name.replace_range(..1, "_");
    }
    // All ASCII after sanitising, so byte truncation is safe.
    name.truncate(MAX_NAME_LEN);

    if !name.is_empty() && name == description {
        return name;
    }

    let digest = hex::encode(Sha256::digest(description.as_bytes()));
    let suffix = &digest[..SUFFIX_LEN];
    if name.is_empty() {
        format!("job-{suffix}")
    } else {
        format!("{name}-{suffix}")
    }
}

/// Checks that the root exists and is a writable directory.
///
/// Returns the canonical root path.
pub(crate) fn prepare_root(root: &Path) -> Result<PathBuf, ConfigError> {
    let display = root.display().to_string();
    if !root.is_dir() {
        return Err(ConfigError::MissingWorkdir(display));
    }

    let probe = root.join(".dish-write-probe");
    std::fs::write(&probe, b"")
        .and_then(|()| std::fs::remove_file(&probe))
        .map_err(|e| ConfigError::UnwritableWorkdir {
            path: display.clone(),
            reason: e.to_string(),
        })?;

    std::fs::canonicalize(root).map_err(|e| ConfigError::UnwritableWorkdir {
        path: display,
        reason: e.to_string(),
    })
}

/// Creates a job's directory under `root` and returns its path.
pub(crate) fn create_job_dir(root: &Path, description: &str) -> Result<PathBuf, ConfigError> {
    let dir = root.join(job_dir_name(description));
    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::UnwritableWorkdir {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_safe_names_pass_through() {
        assert_eq!(job_dir_name("SRR1234567"), "SRR1234567");
        assert_eq!(job_dir_name("liver_rep-1.v2"), "liver_rep-1.v2");
    }

    #[test]
    fn test_unsafe_names_get_suffix() {
        let name = job_dir_name("liver rep 1");
        assert!(name.starts_with("liver_rep_1-"));
        assert_eq!(name.len(), "liver_rep_1-".len() + SUFFIX_LEN);

        // Same sanitised stem, different descriptions.
        assert_ne!(job_dir_name("a/b"), job_dir_name("a b"));
        // Deterministic.
        assert_eq!(job_dir_name("a/b"), job_dir_name("a/b"));
    }

    #[test]
    fn test_dot_and_empty_names() {
        assert!(job_dir_name("..").starts_with("_.-"));
        assert!(job_dir_name(".hidden").starts_with("_hidden-"));
        assert!(job_dir_name("").starts_with("job-"));
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "x".repeat(300);
        let name = job_dir_name(&long);
        assert_eq!(name.len(), MAX_NAME_LEN + 1 + SUFFIX_LEN);
    }

    #[test]
    fn test_prepare_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(prepare_root(dir.path()).is_ok());
        assert!(!dir.path().join(".dish-write-probe").exists());

        let missing = dir.path().join("missing");
        assert!(matches!(prepare_root(&missing), Err(ConfigError::MissingWorkdir(_))));
    }

    #[test]
    fn test_create_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let created = create_job_dir(dir.path(), "sample 1").unwrap();
        assert!(created.is_dir());
        assert_eq!(created.parent(), Some(dir.path()));
    }
}
