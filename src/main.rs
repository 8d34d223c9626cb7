use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ralph_bridge::config::BridgeConfig;
use ralph_bridge::logging::{self, LoggingGuard, LoggingOptions};
use ralph_bridge::session::ProcessingMode;

mod cmd;

#[derive(Parser)]
#[command(name = "ralph-bridge")]
#[command(version, about = "Streams autonomous agent runs to dashboard viewers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit console logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/SSE bridge for the dashboard
    Serve {
        /// Port to serve on (overrides bridge.toml and RALPH_BRIDGE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a local dashboard dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Process a batch of issues in the terminal
    Run {
        /// Issue identifiers, processed by a single agent run
        #[arg(required = true)]
        issue_ids: Vec<String>,

        /// Processing mode: plan or build
        #[arg(short, long)]
        mode: Option<ProcessingMode>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Let the agent push its commits
        #[arg(long)]
        auto_push: bool,
    },
    /// Watch CI check runs for a commit until they settle
    Ci {
        /// Commit SHA (7 to 40 hex characters)
        sha: String,

        /// Run the configured fix command when checks fail
        #[arg(long)]
        auto_fix: bool,

        /// GitHub repository as owner/name (defaults to bridge.toml, then the origin remote)
        #[arg(long)]
        repo: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default bridge.toml file
    Init,
}

/// Load configuration and start logging for commands that do real work.
fn load_runtime(cli: &Cli, project_dir: &Path) -> Result<(BridgeConfig, LoggingGuard)> {
    let dotenv = dotenvy::from_path(project_dir.join(".env"));
    let config = BridgeConfig::load(project_dir.to_path_buf())?;

    let mut options = LoggingOptions::from_section(&config.toml.logging, config.log_file());
    if cli.verbose {
        options.level = "debug".to_string();
    }
    options.json |= cli.json_logs;
    let guard = logging::init(&options)?;

    if let Err(e) = dotenv
        && !e.not_found()
    {
        tracing::warn!(error = %e, "Failed to load .env");
    }
    Ok((config, guard))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone())?;
        }
        Commands::Serve { port, host, dev } => {
            let (config, _guard) = load_runtime(&cli, &project_dir)?;
            cmd::cmd_serve(&config, *port, host.clone(), *dev).await?;
        }
        Commands::Run {
            issue_ids,
            mode,
            model,
            max_iterations,
            auto_push,
        } => {
            let (config, _guard) = load_runtime(&cli, &project_dir)?;
            let overrides = cmd::RunOverrides {
                mode: *mode,
                model: model.clone(),
                max_iterations: *max_iterations,
                auto_push: *auto_push,
            };
            let success = cmd::cmd_run(&config, issue_ids.clone(), overrides, cli.verbose).await?;
            return Ok(exit_code(success));
        }
        Commands::Ci {
            sha,
            auto_fix,
            repo,
        } => {
            let (config, _guard) = load_runtime(&cli, &project_dir)?;
            let success = cmd::cmd_ci(&config, sha, *auto_fix, repo.as_deref()).await?;
            return Ok(exit_code(success));
        }
    }

    Ok(ExitCode::SUCCESS)
}
