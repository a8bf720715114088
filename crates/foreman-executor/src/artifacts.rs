//! Artifact collection.
//!
//! After the last step of a build type succeeds, each artifact rule is
//! evaluated as a glob pattern relative to the job's working directory and
//! every match is copied into the job's artifact directory, preserving its
//! relative path.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::debug;

use foreman_core::run::{CollectedArtifact, LogLine, LogStream, RunEvent};
use foreman_core::step::BuildJob;
use foreman_core::{Error, Result};

pub async fn collect(
    job: &BuildJob,
    events: &mpsc::Sender<RunEvent>,
) -> Result<Vec<CollectedArtifact>> {
    let mut collected = Vec::new();

    for rule in &job.artifact_rules {
        let full_pattern = job.working_dir.join(&rule.pattern);
        let paths = glob::glob(&full_pattern.to_string_lossy()).map_err(|e| {
            Error::ArtifactCollection {
                pattern: rule.pattern.clone(),
                message: e.to_string(),
            }
        })?;

        let mut matched = 0usize;
        for entry in paths {
            let path = entry.map_err(|e| Error::ArtifactCollection {
                pattern: rule.pattern.clone(),
                message: e.to_string(),
            })?;
            if !path.is_file() {
                continue;
            }
            matched += 1;
            let artifact = copy_artifact(job, &path).await?;
            let _ = events
                .send(RunEvent::StepLog {
                    build_type: job.build_type.clone(),
                    line: LogLine::now(
                        LogStream::System,
                        format!(
                            "collected artifact {} ({} bytes)",
                            artifact.path.display(),
                            artifact.size
                        ),
                    ),
                })
                .await;
            collected.push(artifact);
        }

        debug!(
            build_type = %job.build_type,
            pattern = %rule.pattern,
            matched,
            "artifact rule evaluated"
        );
        if matched == 0 && rule.required {
            return Err(Error::ArtifactCollection {
                pattern: rule.pattern.clone(),
                message: "no files matched a required rule".to_string(),
            });
        }
    }

    Ok(collected)
}

async fn copy_artifact(job: &BuildJob, path: &Path) -> Result<CollectedArtifact> {
    let relative = path.strip_prefix(&job.working_dir).unwrap_or(path);
    let dest = job.artifacts_dir.join(relative);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let size = tokio::fs::copy(path, &dest).await?;
    Ok(CollectedArtifact { path: dest, size })
}
