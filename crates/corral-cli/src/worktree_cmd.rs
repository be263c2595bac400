//! `corral worktree ...` commands: one worktree per job.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use corral_core::WorktreeManager;

use crate::config::CorralConfig;
use crate::{branch_for_job, print_json};

#[derive(Subcommand)]
pub enum WorktreeCommands {
    /// Create a worktree on a fresh branch, cleaning up leftovers of earlier attempts
    Create {
        /// Main repository
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Directory for the new worktree
        path: PathBuf,
        /// Branch name (generated from --summary/--job-id when omitted)
        #[arg(long)]
        branch: Option<String>,
        /// Job summary used to name the branch
        #[arg(long)]
        summary: Option<String>,
        /// Job identifier (a fresh UUID when omitted)
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Remove a worktree, optionally deleting its branch
    Remove {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Worktree directory
        path: PathBuf,
        /// Also delete this branch
        #[arg(long)]
        delete_branch: Option<String>,
    },
    /// List worktrees registered with the repository
    List {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Report whether a worktree is registered at a path
    Exists {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        path: PathBuf,
    },
    /// Report whether a directory is a genuine, healthy worktree
    Validate { path: PathBuf },
}

/// Run a worktree subcommand.
pub fn run_worktree_command(command: WorktreeCommands, config: &CorralConfig) -> Result<()> {
    let manager = WorktreeManager::new(config.git());

    match command {
        WorktreeCommands::Create {
            repo,
            path,
            branch,
            summary,
            job_id,
        } => {
            let branch = match branch {
                Some(b) => b,
                None => branch_for_job(config, summary, job_id),
            };
            let result = manager
                .create_worktree(&repo, &path, &branch)
                .with_context(|| format!("failed to create worktree at {}", path.display()))?;
            print_json(&result)
        }
        WorktreeCommands::Remove {
            repo,
            path,
            delete_branch,
        } => {
            let report = manager.remove_worktree(&repo, &path, delete_branch.as_deref())?;
            print_json(&report)
        }
        WorktreeCommands::List { repo } => print_json(&manager.list_worktrees(&repo)?),
        WorktreeCommands::Exists { repo, path } => {
            let exists = manager.worktree_exists(&repo, &path)?;
            print_json(&serde_json::json!({ "exists": exists }))
        }
        WorktreeCommands::Validate { path } => {
            let valid = manager.is_valid_worktree(&path);
            print_json(&serde_json::json!({ "valid": valid }))
        }
    }
}
