use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Dependency-aware issue pipeline runner")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run issues through the phase pipeline
    Run {
        /// JSON file listing the issues and their dependencies
        #[arg(short, long)]
        issues: PathBuf,

        /// Maximum issues in flight. Overrides conveyor.toml and CONVEYOR_MAX_PARALLEL.
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Discard checkpoints and start every issue from the beginning
        #[arg(long)]
        fresh: bool,

        /// Run only implementation, verification and publication, to answer review feedback
        #[arg(long)]
        review_response: bool,
    },
    /// Show fleet and per-issue progress
    Status,
    /// Clear the checkpoint of one issue so it runs from phase one
    Reset { issue: u64 },
    /// Validate a task plan and print its execution waves
    Plan { file: PathBuf },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "conveyor=debug" } else { "conveyor=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            issues,
            max_parallel,
            fresh,
            review_response,
        } => {
            cmd::cmd_run(&project_dir, issues, *max_parallel, *fresh, *review_response).await?;
        }
        Commands::Status => cmd::cmd_status(&project_dir).await?,
        Commands::Reset { issue } => cmd::cmd_reset(&project_dir, *issue).await?,
        Commands::Plan { file } => cmd::cmd_plan(file)?,
    }

    Ok(())
}
