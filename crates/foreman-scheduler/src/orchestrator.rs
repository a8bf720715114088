//! Run orchestrator - executes an execution plan against a step runner.
//!
//! Build types run when all their dependencies have succeeded; independent
//! branches may run concurrently up to a configurable worker-pool size.
//! Composite build types never run steps and derive their state from their
//! dependencies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman_config::{ConfigResult, ParamTable, RunContext, interpolate_build_type, validate};
use foreman_core::descriptor::{BuildTypeKind, Descriptor};
use foreman_core::run::{BuildState, RunEvent, RunResult};
use foreman_core::step::{BuildJob, StepRunner};
use foreman_core::{Error, ExecutionPlan, RunId};

use crate::resolver;

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of build types executing concurrently.
    pub max_workers: usize,
    /// Root working directory for steps.
    pub working_dir: PathBuf,
    /// Directory artifact rule matches are copied into.
    pub artifacts_dir: PathBuf,
    /// Timeout applied to steps that do not set their own.
    pub default_timeout: Option<Duration>,
    pub run_number: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 1,
            working_dir: PathBuf::from("."),
            artifacts_dir: PathBuf::from(".foreman/artifacts"),
            default_timeout: None,
            run_number: 1,
        }
    }
}

/// Orchestrates the execution of a descriptor.
pub struct Orchestrator {
    runner: Arc<dyn StepRunner>,
    opts: RunOptions,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn StepRunner>, opts: RunOptions) -> Self {
        Self { runner, opts }
    }

    /// Validate, resolve and execute a descriptor, returning a channel of
    /// events and a handle for the final result.
    ///
    /// The full validation pass (duplicates, unresolved parameters, unknown
    /// references, cycles) completes before any step executes; a descriptor
    /// that fails it produces no side effects. `targets` restricts the run
    /// to the named build types and their transitive dependencies.
    pub fn execute(
        &self,
        descriptor: &Descriptor,
        targets: Option<&[String]>,
        cancel: CancellationToken,
    ) -> ConfigResult<(mpsc::Receiver<RunEvent>, JoinHandle<RunResult>)> {
        validate(descriptor)?;
        let plan = resolver::resolve_subset(descriptor, targets)?;

        let run_id = RunId::new();
        let run = RunContext::new(run_id, self.opts.run_number);

        let mut kinds: HashMap<String, BuildTypeKind> = HashMap::new();
        let mut jobs: HashMap<String, BuildJob> = HashMap::new();
        for name in plan.order() {
            let scoped = descriptor
                .find_build_type(name)
                .ok_or_else(|| Error::Internal(format!("unknown build type '{}'", name)))?;
            kinds.insert(name.clone(), scoped.build_type.kind);
            if scoped.build_type.is_composite() {
                continue;
            }

            let table = ParamTable::for_build_type(descriptor, name, run.clone())?;
            let (steps, artifact_rules) = interpolate_build_type(scoped.build_type, &table)?;
            jobs.insert(
                name.clone(),
                BuildJob {
                    run_id,
                    build_type: name.clone(),
                    steps,
                    working_dir: self.opts.working_dir.clone(),
                    env: table.env_exports(),
                    vcs_root: scoped.build_type.vcs_root.clone(),
                    artifact_rules,
                    artifacts_dir: self.opts.artifacts_dir.join(name),
                    retry: scoped.build_type.retry.clone(),
                    default_timeout: self.opts.default_timeout,
                    mask: table.sensitive_values().to_vec(),
                },
            );
        }

        let (tx, rx) = mpsc::channel(256);
        let runner = self.runner.clone();
        let max_workers = self.opts.max_workers.max(1);
        let handle = tokio::spawn(execute_inner(
            runner,
            plan,
            kinds,
            jobs,
            max_workers,
            run_id,
            cancel,
            tx,
        ));

        Ok((rx, handle))
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_inner(
    runner: Arc<dyn StepRunner>,
    plan: ExecutionPlan,
    kinds: HashMap<String, BuildTypeKind>,
    mut jobs: HashMap<String, BuildJob>,
    max_workers: usize,
    run_id: RunId,
    cancel: CancellationToken,
    tx: mpsc::Sender<RunEvent>,
) -> RunResult {
    let mut states: HashMap<String, BuildState> = plan
        .order()
        .iter()
        .map(|n| (n.clone(), BuildState::Pending))
        .collect();

    let mut join_set: JoinSet<(String, foreman_core::Result<()>)> = JoinSet::new();

    loop {
        // Settle and launch until no further progress is possible.
        let mut progressed = true;
        while progressed {
            progressed = false;
            for name in plan.order() {
                if !matches!(states.get(name), Some(BuildState::Pending)) {
                    continue;
                }

                if cancel.is_cancelled() {
                    set_state(&mut states, &tx, name, BuildState::Cancelled).await;
                    progressed = true;
                    continue;
                }

                let deps = plan.deps_of(name);
                let failed: Vec<&String> = deps
                    .iter()
                    .filter(|d| {
                        states
                            .get(d.as_str())
                            .map(|s| s.is_terminal() && !s.is_success())
                            .unwrap_or(false)
                    })
                    .collect();
                let all_success = deps.iter().all(|d| {
                    states
                        .get(d.as_str())
                        .map(BuildState::is_success)
                        .unwrap_or(false)
                });

                match kinds.get(name) {
                    Some(BuildTypeKind::Composite) => {
                        let all_terminal = deps.iter().all(|d| {
                            states
                                .get(d.as_str())
                                .map(BuildState::is_terminal)
                                .unwrap_or(true)
                        });
                        if all_terminal {
                            let state = if all_success {
                                BuildState::Succeeded
                            } else {
                                BuildState::Failed {
                                    message: format!(
                                        "dependencies did not succeed: {:?}",
                                        failed
                                    ),
                                }
                            };
                            set_state(&mut states, &tx, name, state).await;
                            progressed = true;
                        }
                    }
                    _ => {
                        if !failed.is_empty() {
                            info!(build_type = %name, ?failed, "skipping build type, dependencies failed");
                            set_state(
                                &mut states,
                                &tx,
                                name,
                                BuildState::Skipped {
                                    reason: format!("dependencies failed: {:?}", failed),
                                },
                            )
                            .await;
                            progressed = true;
                        } else if all_success && join_set.len() < max_workers {
                            let Some(job) = jobs.remove(name) else {
                                continue;
                            };
                            states.insert(name.clone(), BuildState::Running);
                            let _ = tx
                                .send(RunEvent::BuildStarted {
                                    build_type: name.clone(),
                                })
                                .await;

                            let runner = runner.clone();
                            let events = tx.clone();
                            let token = cancel.child_token();
                            let task_name = name.clone();
                            join_set.spawn(async move {
                                let res = runner.run(job, events, token).await;
                                (task_name, res)
                            });
                            progressed = true;
                        }
                    }
                }
            }
        }

        if join_set.is_empty() {
            break;
        }

        match join_set.join_next().await {
            Some(Ok((name, result))) => {
                let state = match result {
                    Ok(()) => {
                        info!(build_type = %name, "build type succeeded");
                        BuildState::Succeeded
                    }
                    Err(Error::Cancelled) => {
                        warn!(build_type = %name, "build type cancelled");
                        BuildState::Cancelled
                    }
                    Err(e) => {
                        error!(build_type = %name, error = %e, "build type failed");
                        BuildState::Failed {
                            message: e.to_string(),
                        }
                    }
                };
                set_state(&mut states, &tx, &name, state).await;
            }
            Some(Err(join_err)) => {
                error!(error = %join_err, "runner task aborted");
            }
            None => {}
        }
    }

    // Anything left non-terminal at this point lost its runner task.
    for (name, state) in states.iter_mut() {
        if !state.is_terminal() {
            warn!(build_type = %name, "build type never reached a terminal state");
            *state = BuildState::Failed {
                message: "runner task ended unexpectedly".to_string(),
            };
        }
    }

    let success = states.values().all(BuildState::is_success);
    let _ = tx.send(RunEvent::RunCompleted { success }).await;

    RunResult {
        run_id,
        success,
        states,
    }
}

async fn set_state(
    states: &mut HashMap<String, BuildState>,
    tx: &mpsc::Sender<RunEvent>,
    name: &str,
    state: BuildState,
) {
    states.insert(name.to_string(), state.clone());
    let _ = tx
        .send(RunEvent::BuildCompleted {
            build_type: name.to_string(),
            state,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::descriptor::{BuildType, Project};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockRunner {
        fail: Vec<String>,
        calls: Mutex<Vec<String>>,
        envs: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    impl MockRunner {
        fn failing(names: &[&str]) -> Self {
            Self {
                fail: names.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepRunner for MockRunner {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(
            &self,
            job: BuildJob,
            _events: mpsc::Sender<RunEvent>,
            cancel: CancellationToken,
        ) -> foreman_core::Result<()> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.calls.lock().unwrap().push(job.build_type.clone());
            self.envs
                .lock()
                .unwrap()
                .insert(job.build_type.clone(), job.env.clone());
            if self.fail.contains(&job.build_type) {
                return Err(Error::StepFailed {
                    build_type: job.build_type,
                    step: "step 1".to_string(),
                    exit_code: Some(1),
                });
            }
            Ok(())
        }
    }

    fn make_build_type(name: &str, depends_on: Vec<&str>) -> BuildType {
        let mut bt = BuildType::new(name, BuildTypeKind::Regular);
        bt.depends_on = depends_on.into_iter().map(String::from).collect();
        bt
    }

    fn descriptor_of(build_types: Vec<BuildType>) -> Descriptor {
        let mut root = Project::new("root");
        for bt in build_types {
            root.add_build_type(bt).unwrap();
        }
        Descriptor::new(root)
    }

    async fn run_to_end(
        runner: Arc<MockRunner>,
        descriptor: &Descriptor,
        cancel: CancellationToken,
    ) -> RunResult {
        let orchestrator = Orchestrator::new(runner, RunOptions::default());
        let (mut rx, handle) = orchestrator.execute(descriptor, None, cancel).unwrap();
        let result = handle.await.unwrap();
        // Drain remaining events so the channel closes cleanly.
        while rx.recv().await.is_some() {}
        result
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let descriptor = descriptor_of(vec![
            make_build_type("c", vec!["b"]),
            make_build_type("a", vec![]),
            make_build_type("b", vec!["a"]),
        ]);
        let runner = Arc::new(MockRunner::default());

        let result = run_to_end(runner.clone(), &descriptor, CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(runner.calls(), ["a", "b", "c"]);
        assert!(result.states.values().all(BuildState::is_success));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_independent_continues() {
        let descriptor = descriptor_of(vec![
            make_build_type("broken", vec![]),
            make_build_type("downstream", vec!["broken"]),
            make_build_type("independent", vec![]),
        ]);
        let runner = Arc::new(MockRunner::failing(&["broken"]));

        let result = run_to_end(runner.clone(), &descriptor, CancellationToken::new()).await;
        assert!(!result.success);
        assert!(matches!(
            result.states["broken"],
            BuildState::Failed { .. }
        ));
        assert!(matches!(
            result.states["downstream"],
            BuildState::Skipped { .. }
        ));
        assert!(result.states["independent"].is_success());
        assert!(!runner.calls().contains(&"downstream".to_string()));
    }

    #[tokio::test]
    async fn test_composite_aggregates_success() {
        let mut build_types = vec![
            make_build_type("suite1", vec![]),
            make_build_type("suite2", vec![]),
        ];
        let mut report = BuildType::new("report", BuildTypeKind::Composite);
        report.depends_on = vec!["suite1".to_string(), "suite2".to_string()];
        build_types.push(report);
        let descriptor = descriptor_of(build_types);
        let runner = Arc::new(MockRunner::default());

        let result = run_to_end(runner.clone(), &descriptor, CancellationToken::new()).await;
        assert!(result.success);
        assert!(result.states["report"].is_success());
        // Composite build types never reach the runner.
        assert!(!runner.calls().contains(&"report".to_string()));
    }

    #[tokio::test]
    async fn test_composite_fails_when_dependency_fails() {
        let mut build_types = vec![
            make_build_type("suite1", vec![]),
            make_build_type("suite2", vec![]),
        ];
        let mut report = BuildType::new("report", BuildTypeKind::Composite);
        report.depends_on = vec!["suite1".to_string(), "suite2".to_string()];
        build_types.push(report);
        let descriptor = descriptor_of(build_types);
        let runner = Arc::new(MockRunner::failing(&["suite2"]));

        let result = run_to_end(runner.clone(), &descriptor, CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.states["suite1"].is_success());
        assert!(matches!(
            result.states["report"],
            BuildState::Failed { .. }
        ));
        assert!(!runner.calls().contains(&"report".to_string()));
    }

    #[tokio::test]
    async fn test_project_params_reach_job_env() {
        let mut root = Project::new("root");
        root.set_param("env.APP_ID", "12b4f8a4");
        root.add_build_type(make_build_type("t1", vec![])).unwrap();
        let descriptor = Descriptor::new(root);
        let runner = Arc::new(MockRunner::default());

        let result = run_to_end(runner.clone(), &descriptor, CancellationToken::new()).await;
        assert!(result.success);
        let envs = runner.envs.lock().unwrap();
        assert_eq!(envs["t1"].get("APP_ID").map(String::as_str), Some("12b4f8a4"));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let descriptor = descriptor_of(vec![
            make_build_type("a", vec![]),
            make_build_type("b", vec!["a"]),
        ]);
        let runner = Arc::new(MockRunner::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_to_end(runner.clone(), &descriptor, cancel).await;
        assert!(!result.success);
        assert!(runner.calls().is_empty());
        assert!(
            result
                .states
                .values()
                .all(|s| matches!(s, BuildState::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_cycle_reported_before_execution() {
        let descriptor = descriptor_of(vec![
            make_build_type("a", vec!["b"]),
            make_build_type("b", vec!["a"]),
        ]);
        let runner = Arc::new(MockRunner::default());
        let orchestrator = Orchestrator::new(runner.clone(), RunOptions::default());

        let err = orchestrator
            .execute(&descriptor, None, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            foreman_config::ConfigError::Model(Error::CycleDetected { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_target_filter_runs_subset() {
        let descriptor = descriptor_of(vec![
            make_build_type("base", vec![]),
            make_build_type("top", vec!["base"]),
            make_build_type("unrelated", vec![]),
        ]);
        let runner = Arc::new(MockRunner::default());
        let orchestrator = Orchestrator::new(runner.clone(), RunOptions::default());

        let (mut rx, handle) = orchestrator
            .execute(
                &descriptor,
                Some(&["top".to_string()]),
                CancellationToken::new(),
            )
            .unwrap();
        let result = handle.await.unwrap();
        while rx.recv().await.is_some() {}

        assert!(result.success);
        assert_eq!(runner.calls(), ["base", "top"]);
        assert!(!result.states.contains_key("unrelated"));
    }
}
