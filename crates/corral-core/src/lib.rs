//! Disposable git workspaces for coding-agent jobs.
//!
//! A job gets either a sandbox branch in the existing checkout
//! ([`sandbox`]) or its own worktree ([`worktree`]). Once the agent is done,
//! [`diff`] captures what changed and [`reconcile`] pushes the branch or
//! merges it locally; [`conflict`] drives a merge that needs resolving.
//!
//! Every git call goes through a [`command::CommandRunner`] with an explicit
//! timeout, wrapped in a [`git::Git`] handle shared by the managers.

pub mod branch;
pub mod command;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod fallback;
pub mod git;
pub mod reconcile;
pub mod sandbox;
pub mod sanitize;
pub mod worktree;

pub use branch::{BranchOptions, generate as generate_branch_name};
pub use command::{CommandError, CommandRunner, GitCli};
pub use config::{SandboxConfig, Timeouts};
pub use conflict::{ConflictInfo, ConflictResolver, Strategy};
pub use diff::{DiffCapture, DiffResult};
pub use git::Git;
pub use reconcile::{ChangeRequest, ChangeRequestPublisher, MergeOutcome, PushMergeCoordinator};
pub use sandbox::{SandboxLifecycleManager, SandboxResult};
pub use worktree::{WorktreeManager, WorktreeResult};
