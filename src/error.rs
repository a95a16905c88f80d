// src/error.rs

//! Error types for newpkg
//!
//! Every fallible operation in the library returns [`Result`]. Drivers map
//! errors onto process exit codes: 0 success, 1 usage error, 2 partial
//! failure, 3 fatal precondition, 4 data corruption.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds produced by newpkg operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid arguments or missing required input
    #[error("usage error: {0}")]
    Usage(String),

    /// Queried package or file absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Query matched more than one manifest
    #[error("ambiguous query '{query}' matches: {}", matches.join(", "))]
    Ambiguous { query: String, matches: Vec<String> },

    /// Manifest identity already present without replacement allowed
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// JSON/YAML violates schema, or a manifest is missing required fields
    #[error("malformed: {0}")]
    Malformed(String),

    /// Filesystem or archive operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// All retries exhausted for a source
    #[error("fetch of {url} failed after {attempts} attempts: {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// A recipe command failed after retries
    #[error("build of {package} failed in stage {stage}: {reason}")]
    Build {
        package: String,
        stage: String,
        reason: String,
    },

    /// Circular dependency between the named packages
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// Unsatisfied dependency or reverse-dependency guard
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Lock held by another driver, or checkpoint mismatch
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Attempt to remove a protected package without --force
    #[error("package '{0}' is protected (use --force to override)")]
    Protected(String),
}

impl Error {
    /// Map an error to the process exit code drivers should use
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 1,
            Error::StateConflict(_) => 3,
            Error::Malformed(_) => 4,
            _ => 2,
        }
    }

    /// Convenience constructor for I/O failures with context
    pub fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Error::Io(format!("{context}: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Usage("bad flag".into()).exit_code(), 1);
        assert_eq!(Error::NotFound("pkg".into()).exit_code(), 2);
        assert_eq!(Error::StateConflict("lock held".into()).exit_code(), 3);
        assert_eq!(Error::Malformed("bad json".into()).exit_code(), 4);
        assert_eq!(
            Error::Protected("glibc".into()).exit_code(),
            2,
            "protected removal is a per-package failure"
        );
    }

    #[test]
    fn test_ambiguous_display() {
        let err = Error::Ambiguous {
            query: "alpha".into(),
            matches: vec!["alpha-1.0".into(), "alpha-1.1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha-1.0"));
        assert!(msg.contains("alpha-1.1"));
    }

    #[test]
    fn test_cycle_display() {
        let err = Error::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
