//! Foreman CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Foreman build orchestration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a build descriptor
    Validate {
        /// Path to the descriptor file
        #[arg(default_value = "foreman.kdl")]
        path: PathBuf,
    },
    /// Show the execution plan for a descriptor
    Plan {
        /// Path to the descriptor file
        #[arg(default_value = "foreman.kdl")]
        path: PathBuf,
        /// Restrict the plan to these build types and their dependencies
        #[arg(long = "build-type")]
        build_types: Vec<String>,
        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a descriptor locally
    Run {
        /// Path to the descriptor file
        #[arg(default_value = "foreman.kdl")]
        path: PathBuf,
        /// Run only these build types and their dependencies
        #[arg(long = "build-type")]
        build_types: Vec<String>,
        /// Maximum number of build types running concurrently
        #[arg(long, default_value = "1")]
        jobs: usize,
        /// Directory collected artifacts are copied into
        #[arg(long, default_value = ".foreman/artifacts")]
        artifacts_dir: PathBuf,
        /// Default step timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Run number, available as %build.number%
        #[arg(long, env = "FOREMAN_RUN_NUMBER", default_value = "1")]
        run_number: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan {
            path,
            build_types,
            json,
        } => {
            commands::plan(&path, &build_types, json)?;
        }
        Commands::Run {
            path,
            build_types,
            jobs,
            artifacts_dir,
            timeout,
            run_number,
        } => {
            commands::run::run_local(&path, &build_types, jobs, artifacts_dir, timeout, run_number)
                .await?;
        }
    }

    Ok(())
}
