//! Reconciliation: getting a job's work back into the repository.
//!
//! With a remote configured, work is committed and pushed, and a change
//! request may be opened through a [`ChangeRequestPublisher`]. Without one,
//! a worktree branch is merged locally into the base branch, but only after
//! a dry-run merge proves it applies cleanly. A conflicting dry run is
//! reported as [`MergeOutcome::Conflict`] and leaves both trees untouched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;
use crate::config::SandboxConfig;
use crate::conflict::{ConflictError, ConflictResolver};
use crate::git::Git;
use crate::sanitize;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Git(#[from] CommandError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// A request to open a pull/merge request for a pushed branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRequest {
    pub repo_path: PathBuf,
    pub branch: String,
    pub title: String,
}

/// Opens change requests on a hosting service. Returns an identifier or URL.
pub trait ChangeRequestPublisher: Send + Sync {
    fn publish(&self, request: &ChangeRequest) -> anyhow::Result<String>;
}

/// Result of [`PushMergeCoordinator::push`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    /// Branch that was actually committed and pushed.
    pub branch: String,
    /// Branch the caller asked for; differs from `branch` when it no longer
    /// existed and the current branch was used instead.
    pub requested_branch: String,
    pub committed: bool,
    /// `false` when no remote is configured.
    pub pushed: bool,
}

/// How a worktree's work was reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Pushed {
        branch: String,
        change_request: Option<String>,
    },
    Merged {
        branch: String,
        base: String,
    },
    Conflict {
        files: Vec<String>,
    },
}

impl MergeOutcome {
    pub fn pushed(&self) -> bool {
        matches!(self, Self::Pushed { .. })
    }

    pub fn merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    pub fn conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn conflict_files(&self) -> &[String] {
        match self {
            Self::Conflict { files } => files,
            _ => &[],
        }
    }
}

/// Outcome of a dry-run merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "files", rename_all = "snake_case")]
pub enum DryRunMerge {
    Clean,
    Conflicts(Vec<String>),
}

#[derive(Clone)]
pub struct PushMergeCoordinator {
    git: Git,
    remote: String,
    resolver: ConflictResolver,
    publisher: Option<Arc<dyn ChangeRequestPublisher>>,
}

impl fmt::Debug for PushMergeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushMergeCoordinator")
            .field("remote", &self.remote)
            .field("publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

impl PushMergeCoordinator {
    pub fn new(git: Git, config: &SandboxConfig) -> Self {
        Self {
            resolver: ConflictResolver::new(git.clone()),
            git,
            remote: config.remote.clone(),
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ChangeRequestPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Stage everything except reserved file names and commit it.
    ///
    /// Returns `false` without committing when nothing ended up staged.
    pub fn commit_all(&self, path: &Path, message: &str) -> Result<bool, ReconcileError> {
        let specs = sanitize::staging_pathspecs(&self.git, path);
        let mut args = vec!["add", "-A", "--"];
        args.extend(specs.iter().map(String::as_str));
        self.git.run(path, &args)?;

        let staged = self.git.run(path, &["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            tracing::info!(path = %path.display(), "nothing staged, skipping commit");
            return Ok(false);
        }

        self.git.run(path, &["commit", "-m", message])?;
        tracing::info!(
            path = %path.display(),
            files = staged.lines().count(),
            "committed changes"
        );
        Ok(true)
    }

    /// Commit and push the sandbox branch of a plain checkout.
    ///
    /// `branch` is checked out first so the commit lands on it. When it no
    /// longer exists the currently checked-out branch is pushed instead. No
    /// configured remote is not an error: the outcome reports `pushed: false`.
    pub fn push(&self, path: &Path, branch: &str, message: &str) -> Result<PushOutcome, ReconcileError> {
        let target = if self.git.branch_exists(path, branch) {
            if self.git.current_branch(path)? != branch {
                tracing::info!(branch, "checking out sandbox branch before commit");
                self.git.run(path, &["checkout", branch])?;
            }
            branch.to_string()
        } else {
            let current = self.git.current_branch(path)?;
            tracing::warn!(
                requested = branch,
                current = %current,
                "sandbox branch is gone, pushing current branch"
            );
            current
        };

        let committed = self.commit_all(path, message)?;

        let pushed = if self.git.has_remote(path, &self.remote) {
            self.git.run_with_timeout(
                path,
                &["push", "-u", &self.remote, &target],
                self.git.timeouts().push(),
            )?;
            tracing::info!(branch = %target, remote = %self.remote, "pushed branch");
            true
        } else {
            tracing::info!(remote = %self.remote, "no remote configured, skipping push");
            false
        };

        Ok(PushOutcome {
            branch: target,
            requested_branch: branch.to_string(),
            committed,
            pushed,
        })
    }

    /// Trial-merge `base` into the branch checked out at `worktree_path`.
    ///
    /// The trial merge never commits and is always aborted, so the worktree
    /// is left as it was.
    pub fn can_merge_cleanly(&self, worktree_path: &Path, base: &str) -> Result<DryRunMerge, ReconcileError> {
        let merge = self
            .git
            .run(worktree_path, &["merge", "--no-commit", "--no-ff", base]);

        let outcome = match merge {
            Ok(_) => Ok(DryRunMerge::Clean),
            Err(e) => match self.resolver.get_conflicting_files(worktree_path) {
                Ok(files) if !files.is_empty() => Ok(DryRunMerge::Conflicts(files)),
                Ok(_) => Err(ReconcileError::Git(e)),
                Err(list_err) => Err(list_err.into()),
            },
        };

        if self.resolver.is_in_merge_conflict(worktree_path) {
            self.resolver.abort_merge(worktree_path)?;
        }

        tracing::debug!(
            path = %worktree_path.display(),
            base,
            outcome = ?outcome.as_ref().ok(),
            "dry-run merge"
        );
        outcome
    }

    /// Reconcile a worktree branch with the repository.
    ///
    /// The worktree's changes are committed first. With a remote, the
    /// branch is pushed (under the worktree push timeout) and a change
    /// request is published if a publisher is attached. Without one, the
    /// branch is merged into the base branch of `repo_path` with `--no-ff`,
    /// but only after a dry run in the worktree comes back clean.
    pub fn push_worktree(
        &self,
        worktree_path: &Path,
        repo_path: &Path,
        branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, ReconcileError> {
        self.commit_all(worktree_path, message)?;

        if self.git.has_remote(worktree_path, &self.remote) {
            self.git.run_with_timeout(
                worktree_path,
                &["push", "-u", &self.remote, branch],
                self.git.timeouts().worktree_push(),
            )?;
            tracing::info!(branch, remote = %self.remote, "pushed worktree branch");
            let change_request = self.publish(repo_path, branch, message);
            return Ok(MergeOutcome::Pushed {
                branch: branch.to_string(),
                change_request,
            });
        }

        let base = self.base_branch(repo_path)?;
        if let DryRunMerge::Conflicts(files) = self.can_merge_cleanly(worktree_path, &base)? {
            tracing::warn!(branch, base = %base, ?files, "merge would conflict, leaving branch unmerged");
            return Ok(MergeOutcome::Conflict { files });
        }

        self.git.run(repo_path, &["checkout", &base])?;
        if let Err(e) = self
            .git
            .run(repo_path, &["merge", "--no-ff", "--no-edit", branch])
        {
            let files = self.resolver.get_conflicting_files(repo_path)?;
            if files.is_empty() {
                return Err(e.into());
            }
            self.resolver.abort_merge(repo_path)?;
            tracing::warn!(branch, base = %base, ?files, "merge conflicted after clean dry run, aborted");
            return Ok(MergeOutcome::Conflict { files });
        }

        tracing::info!(branch, base = %base, "merged worktree branch locally");
        Ok(MergeOutcome::Merged {
            branch: branch.to_string(),
            base,
        })
    }

    /// `main`, else `master`, else whatever the repository has checked out.
    pub fn base_branch(&self, repo_path: &Path) -> Result<String, ReconcileError> {
        Ok(self.git.base_branch(repo_path)?)
    }

    fn publish(&self, repo_path: &Path, branch: &str, message: &str) -> Option<String> {
        let publisher = self.publisher.as_ref()?;
        let request = ChangeRequest {
            repo_path: repo_path.to_path_buf(),
            branch: branch.to_string(),
            title: message.lines().next().unwrap_or(message).trim().to_string(),
        };
        match publisher.publish(&request) {
            Ok(id) => {
                tracing::info!(branch, change_request = %id, "opened change request");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(branch, error = %e, "failed to open change request");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use corral_test_utils::{TestRepo, git};

    use crate::worktree::WorktreeManager;

    fn coordinator() -> PushMergeCoordinator {
        PushMergeCoordinator::new(Git::system(), &SandboxConfig::default())
    }

    #[derive(Default)]
    struct RecordingPublisher {
        requests: Mutex<Vec<ChangeRequest>>,
        fail: bool,
    }

    impl ChangeRequestPublisher for RecordingPublisher {
        fn publish(&self, request: &ChangeRequest) -> anyhow::Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            Ok(format!("cr/{}", request.branch))
        }
    }

    #[test]
    fn push_without_remote_commits_but_does_not_push() {
        let repo = TestRepo::new();
        repo.git(&["checkout", "-b", "agents/work"]);
        repo.write("src/lib.rs", "pub fn work() {}\n");

        let outcome = coordinator()
            .push(repo.path(), "agents/work", "Add work")
            .unwrap();

        assert_eq!(outcome.branch, "agents/work");
        assert!(outcome.committed);
        assert!(!outcome.pushed);
        assert_eq!(repo.git(&["log", "-1", "--format=%s"]), "Add work");
    }

    #[test]
    fn push_with_nothing_to_commit_skips_commit() {
        let repo = TestRepo::new();
        let before = repo.git(&["rev-parse", "HEAD"]);
        let outcome = coordinator().push(repo.path(), "main", "noop").unwrap();
        assert!(!outcome.committed);
        assert_eq!(repo.git(&["rev-parse", "HEAD"]), before);
    }

    #[test]
    fn push_with_remote_updates_remote_branch() {
        let repo = TestRepo::new();
        let remote = repo.add_bare_remote();
        repo.git(&["checkout", "-b", "agents/remote"]);
        repo.write("feature.txt", "done\n");

        let outcome = coordinator()
            .push(repo.path(), "agents/remote", "Feature")
            .unwrap();

        assert!(outcome.pushed);
        let remote_head = git(&remote, &["rev-parse", "refs/heads/agents/remote"]);
        assert_eq!(remote_head, repo.git(&["rev-parse", "HEAD"]));
    }

    #[test]
    fn push_commits_onto_requested_branch_when_elsewhere() {
        let repo = TestRepo::new();
        let remote = repo.add_bare_remote();
        repo.git(&["branch", "agents/parked"]);
        let main_before = repo.git(&["rev-parse", "main"]);
        repo.write("parked.txt", "work\n");

        let outcome = coordinator()
            .push(repo.path(), "agents/parked", "Parked work")
            .unwrap();

        assert_eq!(outcome.branch, "agents/parked");
        assert!(outcome.committed && outcome.pushed);
        assert_eq!(repo.current_branch(), "agents/parked");
        assert_eq!(repo.git(&["rev-parse", "main"]), main_before);
        assert_eq!(repo.git(&["log", "-1", "--format=%s", "agents/parked"]), "Parked work");
        let remote_head = git(&remote, &["rev-parse", "refs/heads/agents/parked"]);
        assert_eq!(remote_head, repo.git(&["rev-parse", "agents/parked"]));
    }

    #[test]
    fn push_falls_back_to_current_branch_when_sandbox_branch_is_gone() {
        let repo = TestRepo::new();
        repo.write("notes.txt", "x\n");
        let outcome = coordinator()
            .push(repo.path(), "agents/deleted", "Notes")
            .unwrap();
        assert_eq!(outcome.branch, "main");
        assert_eq!(outcome.requested_branch, "agents/deleted");
        assert!(outcome.committed);
    }

    #[test]
    fn reserved_names_are_not_committed() {
        let repo = TestRepo::new();
        repo.write("nul", "redirected output\n");
        repo.write("real.txt", "keep\n");

        assert!(coordinator().commit_all(repo.path(), "Keep real").unwrap());

        let tracked = repo.git(&["ls-files"]);
        assert!(tracked.lines().any(|l| l == "real.txt"));
        assert!(!tracked.lines().any(|l| l == "nul"), "reserved file committed: {tracked}");
    }

    #[test]
    fn push_worktree_without_remote_merges_into_base() {
        let repo = TestRepo::new();
        let wt = WorktreeManager::new(Git::system())
            .create_worktree(repo.path(), &repo.scratch_path("wt-merge"), "agents/merge")
            .unwrap();
        std::fs::write(wt.worktree_path.join("added.txt"), "from agent\n").unwrap();

        let outcome = coordinator()
            .push_worktree(&wt.worktree_path, repo.path(), "agents/merge", "Agent work")
            .unwrap();

        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                branch: "agents/merge".into(),
                base: "main".into()
            }
        );
        assert!(outcome.merged());
        assert_eq!(repo.current_branch(), "main");
        assert!(repo.path().join("added.txt").exists());
        // --no-ff: the tip of main is a merge commit with two parents.
        let parents = repo.git(&["rev-list", "--parents", "-n", "1", "HEAD"]);
        assert_eq!(parents.split_whitespace().count(), 3);
    }

    #[test]
    fn push_worktree_conflict_leaves_no_merge_in_progress() {
        let repo = TestRepo::new();
        let wt = WorktreeManager::new(Git::system())
            .create_worktree(repo.path(), &repo.scratch_path("wt-conflict"), "agents/conflict")
            .unwrap();
        std::fs::write(wt.worktree_path.join("README.md"), "# agent version\n").unwrap();
        repo.write("README.md", "# main version\n");
        repo.commit_all("main edits README");
        let main_before = repo.git(&["rev-parse", "main"]);

        let outcome = coordinator()
            .push_worktree(&wt.worktree_path, repo.path(), "agents/conflict", "Agent work")
            .unwrap();

        assert!(outcome.conflict());
        assert_eq!(outcome.conflict_files(), ["README.md".to_string()]);
        let resolver = ConflictResolver::new(Git::system());
        assert!(!resolver.is_in_merge_conflict(&wt.worktree_path));
        assert!(!resolver.is_in_merge_conflict(repo.path()));
        assert_eq!(repo.git(&["rev-parse", "main"]), main_before);
    }

    #[test]
    fn push_worktree_with_remote_pushes_and_publishes() {
        let repo = TestRepo::new();
        let remote = repo.add_bare_remote();
        let wt = WorktreeManager::new(Git::system())
            .create_worktree(repo.path(), &repo.scratch_path("wt-push"), "agents/push")
            .unwrap();
        std::fs::write(wt.worktree_path.join("pushed.txt"), "hello\n").unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let outcome = coordinator()
            .with_publisher(publisher.clone())
            .push_worktree(&wt.worktree_path, repo.path(), "agents/push", "Push it\n\nbody")
            .unwrap();

        assert_eq!(
            outcome,
            MergeOutcome::Pushed {
                branch: "agents/push".into(),
                change_request: Some("cr/agents/push".into())
            }
        );
        let requests = publisher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].title, "Push it");
        assert!(!git(&remote, &["rev-parse", "refs/heads/agents/push"]).is_empty());
        assert!(!repo.path().join("pushed.txt").exists(), "nothing merged locally");
    }

    #[test]
    fn failed_publish_still_counts_as_pushed() {
        let repo = TestRepo::new();
        repo.add_bare_remote();
        let wt = WorktreeManager::new(Git::system())
            .create_worktree(repo.path(), &repo.scratch_path("wt-pub"), "agents/pub")
            .unwrap();
        std::fs::write(wt.worktree_path.join("x.txt"), "x\n").unwrap();

        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let outcome = coordinator()
            .with_publisher(publisher)
            .push_worktree(&wt.worktree_path, repo.path(), "agents/pub", "X")
            .unwrap();

        assert!(outcome.pushed());
        assert_eq!(
            outcome,
            MergeOutcome::Pushed {
                branch: "agents/pub".into(),
                change_request: None
            }
        );
    }

    #[test]
    fn dry_run_merge_is_always_undone() {
        let repo = TestRepo::new();
        repo.diverge("agents/dry", "shared.txt", "branch\n", "main\n");
        let wt_path = repo.scratch_path("wt-dry");
        let wt_str = wt_path.to_string_lossy().to_string();
        repo.git(&["worktree", "add", &wt_str, "agents/dry"]);
        let head_before = git(&wt_path, &["rev-parse", "HEAD"]);

        let result = coordinator().can_merge_cleanly(&wt_path, "main").unwrap();

        assert_eq!(result, DryRunMerge::Conflicts(vec!["shared.txt".into()]));
        assert_eq!(git(&wt_path, &["rev-parse", "HEAD"]), head_before);
        assert!(git(&wt_path, &["status", "--porcelain"]).is_empty());
    }

    #[test]
    fn base_branch_prefers_main_then_master() {
        let repo = TestRepo::new();
        assert_eq!(coordinator().base_branch(repo.path()).unwrap(), "main");

        repo.git(&["branch", "-m", "main", "master"]);
        assert_eq!(coordinator().base_branch(repo.path()).unwrap(), "master");

        repo.git(&["branch", "-m", "master", "trunk"]);
        assert_eq!(coordinator().base_branch(repo.path()).unwrap(), "trunk");
    }
}
