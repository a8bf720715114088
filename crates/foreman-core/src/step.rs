//! The step execution seam.
//!
//! The orchestrator resolves parameters and hands each regular build type to
//! a [`StepRunner`] as a fully interpolated [`BuildJob`]. Runners lower each
//! step to a [`ProcessInvocation`] and execute it as an external process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::descriptor::{ArtifactRule, RetryPolicy, Step, VcsRootRef};
use crate::run::RunEvent;
use crate::{Result, RunId};

/// Resolved work for one regular build type: parameters already
/// interpolated, subprocess environment computed, sensitive values listed
/// for masking.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub run_id: RunId,
    pub build_type: String,
    /// Steps with all `%param%` placeholders substituted.
    pub steps: Vec<Step>,
    /// Root working directory; steps may override with a relative path.
    pub working_dir: PathBuf,
    /// Environment exported to every subprocess of this build type.
    pub env: HashMap<String, String>,
    pub vcs_root: Option<VcsRootRef>,
    pub artifact_rules: Vec<ArtifactRule>,
    /// Directory artifact rule matches are copied into.
    pub artifacts_dir: PathBuf,
    pub retry: Option<RetryPolicy>,
    /// Applies to steps without their own timeout.
    pub default_timeout: Option<Duration>,
    /// Sensitive values, masked from every emitted log line.
    pub mask: Vec<String>,
}

/// A single external process call: command, args, working dir, env,
/// optional timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Trait for step execution backends.
///
/// A runner executes the job's steps strictly in order, stops at the first
/// failure, and collects artifacts only after every step succeeded.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Run all steps of one build type. Emits [`RunEvent::StepStarted`] and
    /// [`RunEvent::StepLog`] events while executing. Returns `Ok(())` when
    /// every step succeeded and artifact collection completed.
    async fn run(
        &self,
        job: BuildJob,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
