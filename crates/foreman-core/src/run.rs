//! Run states, events and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::RunId;

/// State of a build type during a run.
///
/// Regular build types go `Pending -> Running -> {Succeeded, Failed}`.
/// Composite build types never run steps and move straight from `Pending`
/// to a terminal state once all their dependencies are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    /// Never started because a dependency did not succeed.
    Skipped { reason: String },
    Cancelled,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildState::Pending | BuildState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildState::Succeeded)
    }
}

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    BuildStarted {
        build_type: String,
    },
    StepStarted {
        build_type: String,
        step: String,
        attempt: u32,
    },
    StepLog {
        build_type: String,
        line: LogLine,
    },
    BuildCompleted {
        build_type: String,
        state: BuildState,
    },
    RunCompleted {
        success: bool,
    },
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub success: bool,
    pub states: HashMap<String, BuildState>,
}

/// A line of captured subprocess output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn now(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// A file collected by an artifact rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedArtifact {
    /// Path of the copy in the run's artifact directory.
    pub path: PathBuf,
    pub size: u64,
}

/// Replace every occurrence of a sensitive value with a fixed mask.
pub fn mask_secrets(input: &str, secrets: &[String]) -> String {
    let mut out = input.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            out = out.replace(secret.as_str(), "******");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_state_terminal() {
        assert!(!BuildState::Pending.is_terminal());
        assert!(!BuildState::Running.is_terminal());
        assert!(BuildState::Succeeded.is_terminal());
        assert!(
            BuildState::Failed {
                message: "x".into()
            }
            .is_terminal()
        );
        assert!(BuildState::Cancelled.is_terminal());
    }

    #[test]
    fn test_mask_secrets() {
        let secrets = vec!["hunter2".to_string(), String::new()];
        assert_eq!(
            mask_secrets("token=hunter2 rest", &secrets),
            "token=****** rest"
        );
        assert_eq!(mask_secrets("nothing here", &secrets), "nothing here");
    }
}
