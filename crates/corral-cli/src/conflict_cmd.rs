//! `corral conflicts ...` commands: drive a merge that needs resolving.

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use corral_core::{ConflictResolver, Strategy};

use crate::config::CorralConfig;
use crate::print_json;

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// Merge the base branch (main, else master, else the checked-out branch) into a worktree to surface conflicts
    Start {
        /// Worktree to merge into
        worktree: PathBuf,
        /// Main repository whose base branch is merged
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// List files with unresolved conflicts
    List {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Show a preview of each conflict
    Details {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Resolve one file by taking a side
    Resolve {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Conflicting file, relative to the worktree
        file: String,
        /// Side to keep: ours or theirs
        #[arg(long)]
        strategy: Strategy,
    },
    /// Resolve every conflicting file by taking the same side
    ResolveAll {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Side to keep: ours or theirs
        #[arg(long)]
        strategy: Strategy,
    },
    /// Abort the merge in progress
    Abort {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Commit the merge once every conflict is resolved
    Complete {
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Commit message (git's merge message when omitted)
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Report whether a merge is in progress and what still conflicts
    Status {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
}

/// Run a conflicts subcommand.
pub fn run_conflict_command(command: ConflictCommands, config: &CorralConfig) -> Result<()> {
    let resolver = ConflictResolver::new(config.git());

    match command {
        ConflictCommands::Start { worktree, repo } => {
            print_json(&resolver.start_merge_for_resolution(&worktree, &repo)?)
        }
        ConflictCommands::List { path } => print_json(&resolver.get_conflicting_files(&path)?),
        ConflictCommands::Details { path } => print_json(&resolver.get_conflict_details(&path)?),
        ConflictCommands::Resolve {
            path,
            file,
            strategy,
        } => {
            resolver.resolve_conflict(&path, &file, strategy)?;
            print_json(&serde_json::json!({ "resolved": [file], "strategy": strategy }))
        }
        ConflictCommands::ResolveAll { path, strategy } => {
            let files = resolver.resolve_all_conflicts(&path, strategy)?;
            print_json(&serde_json::json!({ "resolved": files, "strategy": strategy }))
        }
        ConflictCommands::Abort { path } => {
            let via = resolver.abort_merge(&path)?;
            print_json(&serde_json::json!({ "aborted": true, "via": via }))
        }
        ConflictCommands::Complete { path, message } => {
            let commit = resolver.complete_merge(&path, message.as_deref())?;
            print_json(&serde_json::json!({ "completed": true, "commit": commit }))
        }
        ConflictCommands::Status { path } => {
            let in_merge = resolver.is_in_merge_conflict(&path);
            let files = if in_merge {
                resolver.get_conflicting_files(&path)?
            } else {
                Vec::new()
            };
            print_json(&serde_json::json!({ "in_merge": in_merge, "conflicting_files": files }))
        }
    }
}
