mod config;
mod conflict_cmd;
mod sandbox_cmd;
#[cfg(test)]
mod test_util;
mod worktree_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use corral_core::diff::DiffCapture;
use corral_core::{BranchOptions, PushMergeCoordinator, generate_branch_name};

use config::CorralConfig;
use conflict_cmd::ConflictCommands;
use sandbox_cmd::SandboxCommands;
use worktree_cmd::WorktreeCommands;

#[derive(Parser)]
#[command(name = "corral", version, about = "Disposable git sandboxes and worktrees for coding-agent jobs")]
struct Cli {
    /// Branch namespace (overrides CORRAL_NAMESPACE env var)
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Artifacts directory (overrides CORRAL_ARTIFACTS_DIR env var)
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default corral config file (stores --namespace if given)
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the branch name for a job
    BranchName {
        /// Human summary of the job
        #[arg(long)]
        summary: Option<String>,
        /// Job identifier (a fresh UUID when omitted)
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Branch-mode sandboxes in an existing checkout
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// Worktree-mode isolation, one worktree per job
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
    /// Capture unstaged and staged changes as JSON
    Diff {
        /// Working tree to inspect
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Also write diff.patch and changed-files.json under the artifacts dir
        #[arg(long)]
        persist: bool,
    },
    /// Merge conflict inspection and resolution
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Commit a worktree and push it, or merge it locally when there is no remote
    Reconcile {
        /// Worktree holding the job's work
        worktree: PathBuf,
        /// Main repository
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Branch checked out in the worktree
        #[arg(long)]
        branch: String,
        /// Commit message
        #[arg(long, short)]
        message: String,
    },
}

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{json}");
    Ok(())
}

/// Branch name for a job under the configured namespace.
pub(crate) fn branch_for_job(config: &CorralConfig, summary: Option<String>, job_id: Option<String>) -> String {
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut options = BranchOptions::new(job_id).prefix(config.sandbox.namespace.clone());
    options.summary = summary;
    generate_branch_name(&options)
}

/// Execute the `corral init` command: write config file.
fn cmd_init(namespace: Option<String>, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    if let Some(ns) = namespace {
        cfg.sandbox.namespace = ns;
    }
    let path = config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  sandbox.namespace = {}", cfg.sandbox.namespace);
    println!("  sandbox.remote = {}", cfg.sandbox.remote);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    // `init` must work even when the existing config file is broken.
    match cli.command {
        Commands::Init { force } => cmd_init(cli.namespace, force),
        command => {
            let config =
                CorralConfig::resolve(cli.namespace.as_deref(), cli.artifacts_dir.as_deref())?;
            dispatch(command, &config)
        }
    }
}

fn dispatch(command: Commands, config: &CorralConfig) -> Result<()> {
    match command {
        Commands::Init { .. } => unreachable!("init runs before config resolution"),
        Commands::BranchName { summary, job_id } => {
            println!("{}", branch_for_job(config, summary, job_id));
            Ok(())
        }
        Commands::Sandbox { command } => sandbox_cmd::run_sandbox_command(command, config),
        Commands::Worktree { command } => worktree_cmd::run_worktree_command(command, config),
        Commands::Diff { path, persist } => {
            let capture = DiffCapture::new(config.git());
            if persist {
                let (diff, artifacts) = capture.capture_to(&path, &config.artifacts_dir)?;
                print_json(&serde_json::json!({ "diff": diff, "artifacts": artifacts }))
            } else {
                print_json(&capture.capture(&path)?)
            }
        }
        Commands::Conflicts { command } => conflict_cmd::run_conflict_command(command, config),
        Commands::Reconcile {
            worktree,
            repo,
            branch,
            message,
        } => {
            let coordinator = PushMergeCoordinator::new(config.git(), &config.sandbox);
            let outcome = coordinator
                .push_worktree(&worktree, &repo, &branch, &message)
                .with_context(|| format!("failed to reconcile {branch}"))?;
            print_json(&outcome)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
