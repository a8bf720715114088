//! Error types for Foreman.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("unresolved parameter '%{name}%' referenced by '{scope}'")]
    UnresolvedParameter { name: String, scope: String },

    #[error("cycle detected in dependencies: {}", .members.join(" -> "))]
    CycleDetected { members: Vec<String> },

    #[error("step '{step}' of build type '{build_type}' failed (exit code {exit_code:?})")]
    StepFailed {
        build_type: String,
        step: String,
        exit_code: Option<i32>,
    },

    #[error("step '{step}' of build type '{build_type}' timed out after {limit:?}")]
    Timeout {
        build_type: String,
        step: String,
        limit: Duration,
    },

    #[error("artifact collection failed for '{pattern}': {message}")]
    ArtifactCollection { pattern: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a per-step retry policy may be applied to this error.
    /// Only execution failures are retryable; configuration errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StepFailed { .. } | Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
