//! Runs build steps as local subprocesses.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_core::descriptor::{Step, StepKind};
use foreman_core::run::{LogLine, LogStream, RunEvent, mask_secrets};
use foreman_core::step::{BuildJob, ProcessInvocation, StepRunner};
use foreman_core::{Error, Result};

use crate::artifacts;

/// Executes steps as subprocesses on the local machine.
#[derive(Debug, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for LocalProcessRunner {
    fn name(&self) -> &'static str {
        "local-process"
    }

    async fn run(
        &self,
        job: BuildJob,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        for (index, step) in job.steps.iter().enumerate() {
            let label = step.label(index);
            let invocation = lower_step(&job, step);
            run_step_with_retry(&job, &label, &invocation, &events, &cancel).await?;
        }

        let collected = artifacts::collect(&job, &events).await?;
        if !collected.is_empty() {
            info!(
                build_type = %job.build_type,
                count = collected.len(),
                "collected artifacts"
            );
        }
        Ok(())
    }
}

/// Lower a step to its process invocation. This is the only place a step
/// kind turns into a command line.
fn lower_step(job: &BuildJob, step: &Step) -> ProcessInvocation {
    let working_dir = match &step.working_dir {
        Some(dir) => job.working_dir.join(dir),
        None => job.working_dir.clone(),
    };
    let timeout = step.timeout.or(job.default_timeout);

    let (program, args) = match &step.kind {
        StepKind::Tool { program, args } => (program.clone(), args.clone()),
        StepKind::Script { body } => (
            "/bin/sh".to_string(),
            vec!["-c".to_string(), body.clone()],
        ),
        StepKind::ContainerBuild {
            dockerfile,
            context,
            tags,
            extra_args,
        } => {
            let mut args = vec!["build".to_string(), "-f".to_string(), dockerfile.clone()];
            for tag in tags {
                args.push("-t".to_string());
                args.push(tag.clone());
            }
            args.extend(extra_args.iter().cloned());
            args.push(context.clone());
            ("docker".to_string(), args)
        }
    };

    ProcessInvocation {
        program,
        args,
        working_dir,
        env: job.env.clone(),
        timeout,
    }
}

async fn run_step_with_retry(
    job: &BuildJob,
    label: &str,
    invocation: &ProcessInvocation,
    events: &mpsc::Sender<RunEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let max_attempts = job.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1);
    let backoff = job
        .retry
        .as_ref()
        .map(|r| r.backoff)
        .unwrap_or(Duration::ZERO);

    let mut attempt = 1;
    loop {
        let _ = events
            .send(RunEvent::StepStarted {
                build_type: job.build_type.clone(),
                step: label.to_string(),
                attempt,
            })
            .await;

        match run_process(job, label, invocation, events, cancel).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    build_type = %job.build_type,
                    step = %label,
                    attempt,
                    error = %e,
                    "step failed, retrying"
                );
                system_line(
                    events,
                    job,
                    format!("step '{}' failed ({}), retrying after {:?}", label, e, backoff),
                )
                .await;
                if !backoff.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_process(
    job: &BuildJob,
    label: &str,
    invocation: &ProcessInvocation,
    events: &mpsc::Sender<RunEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!(
        build_type = %job.build_type,
        step = %label,
        program = %invocation.program,
        "spawning step process"
    );

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = stdout.map(|out| {
        tokio::spawn(forward_lines(
            out,
            LogStream::Stdout,
            job.build_type.clone(),
            job.mask.clone(),
            events.clone(),
        ))
    });
    let err_task = stderr.map(|err| {
        tokio::spawn(forward_lines(
            err,
            LogStream::Stderr,
            job.build_type.clone(),
            job.mask.clone(),
            events.clone(),
        ))
    });

    let limit = invocation.timeout;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            flush(out_task, err_task).await;
            return Err(Error::Cancelled);
        }
        _ = tokio::time::sleep(limit.unwrap_or(Duration::ZERO)), if limit.is_some() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            flush(out_task, err_task).await;
            system_line(events, job, format!("step '{}' killed: timeout", label)).await;
            return Err(Error::Timeout {
                build_type: job.build_type.clone(),
                step: label.to_string(),
                limit: limit.unwrap_or(Duration::ZERO),
            });
        }
    };
    flush(out_task, err_task).await;

    if status.success() {
        Ok(())
    } else {
        Err(Error::StepFailed {
            build_type: job.build_type.clone(),
            step: label.to_string(),
            exit_code: status.code(),
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: LogStream,
    build_type: String,
    mask: Vec<String>,
    events: mpsc::Sender<RunEvent>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let masked = mask_secrets(&line, &mask);
        let _ = events
            .send(RunEvent::StepLog {
                build_type: build_type.clone(),
                line: LogLine::now(stream, masked),
            })
            .await;
    }
}

async fn flush(
    out_task: Option<tokio::task::JoinHandle<()>>,
    err_task: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = out_task {
        let _ = task.await;
    }
    if let Some(task) = err_task {
        let _ = task.await;
    }
}

async fn system_line(events: &mpsc::Sender<RunEvent>, job: &BuildJob, content: String) {
    let masked = mask_secrets(&content, &job.mask);
    let _ = events
        .send(RunEvent::StepLog {
            build_type: job.build_type.clone(),
            line: LogLine::now(LogStream::System, masked),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::RunId;
    use foreman_core::descriptor::RetryPolicy;
    use std::collections::HashMap;
    use std::path::Path;

    fn script_step(body: &str) -> Step {
        Step::new(StepKind::Script {
            body: body.to_string(),
        })
    }

    fn make_job(dir: &Path, steps: Vec<Step>) -> BuildJob {
        BuildJob {
            run_id: RunId::new(),
            build_type: "t1".to_string(),
            steps,
            working_dir: dir.to_path_buf(),
            env: HashMap::new(),
            vcs_root: None,
            artifact_rules: Vec::new(),
            artifacts_dir: dir.join("artifacts"),
            retry: None,
            default_timeout: None,
            mask: Vec::new(),
        }
    }

    async fn run_and_drain(job: BuildJob) -> (Result<()>, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let runner = LocalProcessRunner::new();
        let result = runner.run(job, tx, CancellationToken::new()).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn log_lines(events: &[RunEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepLog { line, .. } => Some(line.content.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_script_output_captured() {
        let dir = tempfile::tempdir().unwrap();
        let job = make_job(dir.path(), vec![script_step("echo hello from foreman")]);

        let (result, events) = run_and_drain(job).await;
        result.unwrap();
        assert!(
            log_lines(&events)
                .iter()
                .any(|l| l == "hello from foreman")
        );
    }

    #[tokio::test]
    async fn test_secret_masked_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = make_job(dir.path(), vec![script_step("echo token=hunter2")]);
        job.mask = vec!["hunter2".to_string()];

        let (result, events) = run_and_drain(job).await;
        result.unwrap();
        let lines = log_lines(&events);
        assert!(lines.iter().any(|l| l == "token=******"));
        assert!(!lines.iter().any(|l| l.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_failing_step_stops_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let job = make_job(
            dir.path(),
            vec![
                script_step("exit 3"),
                script_step("echo never reached > late.txt"),
            ],
        );

        let (result, _) = run_and_drain(job).await;
        match result.unwrap_err() {
            Error::StepFailed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut step = script_step("sleep 10");
        step.timeout = Some(Duration::from_millis(100));
        let job = make_job(dir.path(), vec![step]);

        let (result, _) = run_and_drain(job).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let dir = tempfile::tempdir().unwrap();
        // Fails on the first attempt, succeeds once the marker file exists.
        let body = "if [ -f marker ]; then exit 0; else touch marker; exit 1; fi";
        let mut job = make_job(dir.path(), vec![script_step(body)]);
        job.retry = Some(RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        });

        let (result, events) = run_and_drain(job).await;
        result.unwrap();
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepStarted { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, [1, 2]);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = make_job(dir.path(), vec![script_step("exit 1")]);
        job.retry = Some(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        });

        let (result, events) = run_and_drain(job).await;
        assert!(matches!(result.unwrap_err(), Error::StepFailed { .. }));
        let starts = events
            .iter()
            .filter(|e| matches!(e, RunEvent::StepStarted { .. }))
            .count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn test_env_exported_to_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = make_job(dir.path(), vec![script_step("echo value=$FOREMAN_TEST_VAR")]);
        job.env
            .insert("FOREMAN_TEST_VAR".to_string(), "42".to_string());

        let (result, events) = run_and_drain(job).await;
        result.unwrap();
        assert!(log_lines(&events).iter().any(|l| l == "value=42"));
    }

    #[tokio::test]
    async fn test_step_working_dir_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut step = script_step("pwd");
        step.working_dir = Some("sub".into());
        let job = make_job(dir.path(), vec![step]);

        let (result, events) = run_and_drain(job).await;
        result.unwrap();
        assert!(log_lines(&events).iter().any(|l| l.ends_with("/sub")));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let job = make_job(dir.path(), vec![script_step("sleep 10")]);

        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let runner = LocalProcessRunner::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { runner.run(job, tx, token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result.unwrap_err(), Error::Cancelled));
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_lower_container_build() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new(StepKind::ContainerBuild {
            dockerfile: "./docker/Dockerfile".to_string(),
            context: ".".to_string(),
            tags: vec!["acme/todo-backend:7".to_string()],
            extra_args: vec!["--pull".to_string()],
        });
        let job = make_job(dir.path(), vec![step.clone()]);

        let invocation = lower_step(&job, &step);
        assert_eq!(invocation.program, "docker");
        assert_eq!(
            invocation.args,
            [
                "build",
                "-f",
                "./docker/Dockerfile",
                "-t",
                "acme/todo-backend:7",
                "--pull",
                "."
            ]
        );
    }
}
