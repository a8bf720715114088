//! Local run command.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use foreman_config::load_descriptor;
use foreman_core::run::{BuildState, LogStream, RunEvent};
use foreman_executor::LocalProcessRunner;
use foreman_scheduler::{Orchestrator, RunOptions};

/// Run a descriptor locally with the process runner.
pub async fn run_local(
    path: &Path,
    build_types: &[String],
    jobs: usize,
    artifacts_dir: PathBuf,
    timeout_secs: Option<u64>,
    run_number: u64,
) -> Result<()> {
    let descriptor = load_descriptor(path)
        .with_context(|| format!("failed to load descriptor: {}", path.display()))?;

    // Steps run relative to the directory containing the descriptor.
    let working_dir = path
        .parent()
        .map(|p| {
            if p.as_os_str().is_empty() {
                Path::new(".")
            } else {
                p
            }
        })
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("failed to resolve working directory")?;

    println!("Running project: {}", descriptor.root().name());
    println!("Working directory: {}", working_dir.display());

    let opts = RunOptions {
        max_workers: jobs,
        working_dir,
        artifacts_dir,
        default_timeout: timeout_secs.map(Duration::from_secs),
        run_number,
    };
    let orchestrator = Orchestrator::new(Arc::new(LocalProcessRunner::new()), opts);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let targets = (!build_types.is_empty()).then_some(build_types);
    let (mut rx, result_handle) = orchestrator.execute(&descriptor, targets, cancel)?;

    println!("\n--- Starting run ---\n");

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::BuildStarted { build_type } => {
                println!("▶ '{}' started", build_type);
            }
            RunEvent::StepStarted {
                build_type,
                step,
                attempt,
            } => {
                if attempt > 1 {
                    println!("  [{}] step '{}' (attempt {})", build_type, step, attempt);
                } else {
                    println!("  [{}] step '{}'", build_type, step);
                }
            }
            RunEvent::StepLog { build_type, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", build_type, stream_marker, line.content);
            }
            RunEvent::BuildCompleted { build_type, state } => match state {
                BuildState::Succeeded => println!("✓ '{}' succeeded\n", build_type),
                BuildState::Failed { message } => {
                    println!("✗ '{}' failed: {}\n", build_type, message)
                }
                BuildState::Skipped { reason } => {
                    println!("⊘ '{}' skipped: {}\n", build_type, reason)
                }
                BuildState::Cancelled => println!("⊘ '{}' cancelled\n", build_type),
                _ => {}
            },
            RunEvent::RunCompleted { success } => {
                if success {
                    println!("--- Run completed successfully ---");
                } else {
                    println!("--- Run failed ---");
                }
            }
        }
    }

    let result = result_handle.await.context("run task failed")?;

    println!("\n--- Summary (run {}) ---", result.run_id);
    for (name, state) in &result.states {
        let status = match state {
            BuildState::Succeeded => "✓ succeeded".to_string(),
            BuildState::Failed { message } => format!("✗ failed: {}", message),
            BuildState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            BuildState::Cancelled => "⊘ cancelled".to_string(),
            BuildState::Pending => "○ pending".to_string(),
            BuildState::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", name, status);
    }

    if result.success {
        println!("\n✓ Run succeeded!");
        Ok(())
    } else {
        anyhow::bail!("run failed");
    }
}
