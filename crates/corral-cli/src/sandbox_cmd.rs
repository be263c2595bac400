//! `corral sandbox ...` commands: branch-mode sandboxes in an existing
//! checkout.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use corral_core::SandboxLifecycleManager;

use crate::config::CorralConfig;
use crate::{branch_for_job, print_json};

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Create a sandbox branch from an up-to-date main/master
    Create {
        /// Working directory of the repository
        #[arg(long, default_value = ".")]
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
        /// Skip the clean working directory check (retry mode)
        #[arg(long)]
        skip_clean_check: bool,
    },
    /// Check out an existing sandbox branch (retry mode, no pull)
    Checkout {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Branch to check out
        branch: String,
    },
    /// Report whether the working tree is clean, ignoring housekeeping files
    IsClean {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Hard-reset tracked files and remove untracked ones
    Reset {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Throw the sandbox away and return to the previous branch
    Discard {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Sandbox branch to delete
        branch: String,
        /// Branch to return to (falls back to main, then master)
        #[arg(long)]
        previous: Option<String>,
    },
    /// Commit everything and push the sandbox branch if a remote exists
    Push {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Sandbox branch to push
        branch: String,
        /// Commit message
        #[arg(long, short)]
        message: String,
    },
    /// Print a patch of the working tree against HEAD or a base ref
    Patch {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Ref to diff against instead of HEAD
        #[arg(long)]
        base: Option<String>,
    },
}

/// Run a sandbox subcommand.
pub fn run_sandbox_command(command: SandboxCommands, config: &CorralConfig) -> Result<()> {
    let manager = SandboxLifecycleManager::new(config.git(), config.sandbox.clone());

    match command {
        SandboxCommands::Create {
            path,
            branch,
            summary,
            job_id,
            skip_clean_check,
        } => {
            let branch = match branch {
                Some(b) => b,
                None => branch_for_job(config, summary, job_id),
            };
            let result = manager
                .create_sandbox(&path, &branch, skip_clean_check)
                .with_context(|| format!("failed to create sandbox {branch} in {}", path.display()))?;
            print_json(&result)
        }
        SandboxCommands::Checkout { path, branch } => {
            let result = manager
                .checkout_existing_branch(&path, &branch)
                .with_context(|| format!("failed to check out {branch}"))?;
            print_json(&result)
        }
        SandboxCommands::IsClean { path } => {
            let dirty = manager.dirty_files(&path)?;
            print_json(&serde_json::json!({
                "clean": dirty.is_empty(),
                "dirty_files": dirty,
            }))
        }
        SandboxCommands::Reset { path } => {
            manager.reset_and_clean(&path)?;
            print_json(&serde_json::json!({ "reset": true }))
        }
        SandboxCommands::Discard {
            path,
            branch,
            previous,
        } => {
            let report = manager.discard(&path, &branch, previous.as_deref())?;
            print_json(&report)
        }
        SandboxCommands::Push {
            path,
            branch,
            message,
        } => {
            let outcome = manager
                .push(&path, &branch, &message)
                .with_context(|| format!("failed to push {branch}"))?;
            print_json(&outcome)
        }
        SandboxCommands::Patch { path, base } => {
            let patch = manager.generate_patch(&path, base.as_deref())?;
            if !patch.is_empty() {
                println!("{patch}");
            }
            Ok(())
        }
    }
}
