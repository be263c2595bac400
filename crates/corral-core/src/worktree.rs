//! Git worktree management for concurrent job isolation.
//!
//! Each job runs in its own worktree: a separate working directory sharing
//! the object store of the main repository. Several jobs can therefore run
//! against one repository at once without fighting over a single checkout.
//!
//! Worktrees destroyed non-gracefully (killed jobs, deleted temp dirs) leave
//! stale registrations, leftover directories and orphaned branches behind.
//! [`WorktreeManager::create_worktree`] clears all of those before creating,
//! so a retried job can reuse its path and branch name without manual
//! cleanup.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;
use crate::fallback::FallbackChain;
use crate::git::{Git, read_gitdir_pointer};

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed.
    #[error(transparent)]
    Git(#[from] CommandError),

    /// `git worktree add` failed after every cleanup fallback.
    #[error("failed to create worktree at {path} for branch {branch}: {source}")]
    Create {
        path: PathBuf,
        branch: String,
        #[source]
        source: CommandError,
    },

    /// A directory could not be created or removed.
    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A removal step ran but the directory is still on disk.
    #[error("directory still present after removal: {0}")]
    StillPresent(PathBuf),
}

/// How the new worktree got its branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeAttach {
    /// Normal path: a fresh branch created with the worktree.
    NewBranch,
    /// Degraded path: an old branch could not be deleted, so the worktree
    /// checks it out as-is.
    ExistingBranch,
}

/// Which step removed a worktree directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPath {
    GitRemove,
    Prune,
    ForceDelete,
}

/// Identity of a created worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeResult {
    pub worktree_path: PathBuf,
    pub branch: String,
    pub repo_path: PathBuf,
    pub attach: WorktreeAttach,
}

/// Outcome of [`WorktreeManager::remove_worktree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub path: RemovalPath,
    pub branch_deleted: bool,
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory, as git reports it.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
    /// Git flagged the entry as prunable (its directory is gone).
    pub prunable: bool,
}

/// Creates, inspects and removes worktrees.
///
/// The manager adds no locking of its own; git serialises ref and index
/// updates with its lock files.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
}

impl WorktreeManager {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Create a worktree at `worktree_path` on a fresh `branch_name`.
    ///
    /// Before creating, stale registrations are pruned, any directory at the
    /// target is removed, and a leftover branch with the same name is
    /// deleted. When that branch cannot be deleted the worktree is attached
    /// to it instead ([`WorktreeAttach::ExistingBranch`]).
    ///
    /// # Errors
    ///
    /// Returns [`WorktreeError::Create`] if `git worktree add` fails; any
    /// partially created directory is removed on a best-effort basis.
    pub fn create_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
    ) -> Result<WorktreeResult, WorktreeError> {
        self.ensure_repo(repo_path)?;
        let worktree_path = absolute(worktree_path);

        // 1. Stale registrations pointing at deleted directories.
        self.prune(repo_path, false);

        // 2. A directory already at the target path.
        if worktree_path.exists() {
            let removed = self.clear_directory(repo_path, &worktree_path)?;
            tracing::info!(
                path = %worktree_path.display(),
                removal = ?removed,
                "cleared existing worktree directory"
            );
        }

        // 3 + 4. An orphaned branch with the target name.
        let attach = self.clear_branch(repo_path, branch_name);

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::Io {
                message: format!("failed to create worktree parent {}", parent.display()),
                source,
            })?;
        }

        let path_str = worktree_path.to_string_lossy().to_string();
        let result = match attach {
            WorktreeAttach::NewBranch => self
                .git
                .run(repo_path, &["worktree", "add", "-b", branch_name, &path_str]),
            WorktreeAttach::ExistingBranch => self
                .git
                .run(repo_path, &["worktree", "add", &path_str, branch_name]),
        };

        if let Err(source) = result {
            self.cleanup_partial(repo_path, &worktree_path);
            return Err(WorktreeError::Create {
                path: worktree_path,
                branch: branch_name.to_string(),
                source,
            });
        }

        tracing::info!(
            path = %worktree_path.display(),
            branch = branch_name,
            ?attach,
            "created worktree"
        );
        Ok(WorktreeResult {
            worktree_path,
            branch: branch_name.to_string(),
            repo_path: repo_path.to_path_buf(),
            attach,
        })
    }

    /// Remove a worktree and optionally its branch.
    ///
    /// A failed `git worktree remove` falls back to pruning; a failed branch
    /// deletion is logged and ignored since the branch may already be gone.
    pub fn remove_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        delete_branch: Option<&str>,
    ) -> Result<RemovalReport, WorktreeError> {
        let worktree_path = absolute(worktree_path);
        let path_str = worktree_path.to_string_lossy().to_string();

        let (path, ()) = FallbackChain::new("remove worktree")
            .then(RemovalPath::GitRemove, || {
                self.git
                    .run(repo_path, &["worktree", "remove", "--force", &path_str])
                    .map(|_| ())
            })
            .then(RemovalPath::Prune, || {
                self.git.run(repo_path, &["worktree", "prune"]).map(|_| ())
            })
            .run()
            .map_err(|exhausted| match exhausted.into_last() {
                Some(e) => WorktreeError::Git(e),
                None => WorktreeError::StillPresent(worktree_path.clone()),
            })?;

        let branch_deleted = match delete_branch {
            Some(branch) => match self.git.delete_branch(repo_path, branch) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(branch, error = %e, "branch not deleted");
                    false
                }
            },
            None => false,
        };

        Ok(RemovalReport {
            path,
            branch_deleted,
        })
    }

    /// Whether git has a worktree registered at `worktree_path`.
    pub fn worktree_exists(&self, repo_path: &Path, worktree_path: &Path) -> Result<bool, WorktreeError> {
        let target = absolute(worktree_path);
        Ok(self
            .list_worktrees(repo_path)?
            .iter()
            .any(|wt| same_path(&wt.path, &target)))
    }

    /// List all worktrees associated with the main repository.
    pub fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let stdout = self
            .git
            .run(repo_path, &["worktree", "list", "--porcelain"])?;
        Ok(parse_porcelain_output(&stdout))
    }

    /// A genuine worktree has a `.git` *file* pointing at a live git
    /// directory and answers a status query. A `.git` directory means a full
    /// repository, not a worktree.
    pub fn is_valid_worktree(&self, worktree_path: &Path) -> bool {
        let dot_git = worktree_path.join(".git");
        if !dot_git.is_file() {
            return false;
        }
        let Some(target) = read_gitdir_pointer(&dot_git) else {
            return false;
        };
        let target = if target.is_absolute() {
            target
        } else {
            worktree_path.join(target)
        };
        if !target.is_dir() {
            return false;
        }
        self.git.status(worktree_path).is_ok()
    }

    fn ensure_repo(&self, repo_path: &Path) -> Result<(), WorktreeError> {
        self.git
            .run(repo_path, &["rev-parse", "--git-dir"])
            .map(|_| ())
            .map_err(|_| WorktreeError::NotAGitRepo(repo_path.to_path_buf()))
    }

    /// Prune stale worktree entries. `aggressive` also expires entries git
    /// would otherwise keep for a grace period.
    fn prune(&self, repo_path: &Path, aggressive: bool) {
        let args: &[&str] = if aggressive {
            &["worktree", "prune", "--expire", "now"]
        } else {
            &["worktree", "prune"]
        };
        if let Err(e) = self.git.run(repo_path, args) {
            tracing::warn!(repo = %repo_path.display(), error = %e, "worktree prune failed");
        }
    }

    /// Remove whatever sits at `path`: git's own remove, then prune, then
    /// the filesystem.
    fn clear_directory(&self, repo_path: &Path, path: &Path) -> Result<RemovalPath, WorktreeError> {
        let path_str = path.to_string_lossy().to_string();
        let gone = |p: &Path| {
            if p.exists() {
                Err(WorktreeError::StillPresent(p.to_path_buf()))
            } else {
                Ok(())
            }
        };

        FallbackChain::new("clear worktree directory")
            .then(RemovalPath::GitRemove, || {
                self.git
                    .run(repo_path, &["worktree", "remove", "--force", &path_str])?;
                gone(path)
            })
            .then(RemovalPath::Prune, || {
                self.git.run(repo_path, &["worktree", "prune"])?;
                gone(path)
            })
            .then(RemovalPath::ForceDelete, || {
                std::fs::remove_dir_all(path).map_err(|source| WorktreeError::Io {
                    message: format!("failed to delete {}", path.display()),
                    source,
                })
            })
            .run()
            .map(|(tag, ())| tag)
            .map_err(|exhausted| {
                exhausted
                    .into_last()
                    .unwrap_or_else(|| WorktreeError::StillPresent(path.to_path_buf()))
            })
    }

    /// Delete a leftover branch named `branch`, retrying after an aggressive
    /// prune. Reports which way the worktree should attach.
    fn clear_branch(&self, repo_path: &Path, branch: &str) -> WorktreeAttach {
        if !self.git.branch_exists(repo_path, branch) {
            return WorktreeAttach::NewBranch;
        }

        let first = match self.git.delete_branch(repo_path, branch) {
            Ok(()) => {
                tracing::info!(branch, "deleted orphaned branch");
                return WorktreeAttach::NewBranch;
            }
            Err(e) => e,
        };

        tracing::warn!(branch, error = %first, "orphaned branch is locked, pruning aggressively");
        self.prune(repo_path, true);

        match self.git.delete_branch(repo_path, branch) {
            Ok(()) => {
                tracing::info!(branch, "deleted orphaned branch after aggressive prune");
                WorktreeAttach::NewBranch
            }
            Err(e) => {
                tracing::warn!(
                    branch,
                    error = %e,
                    "branch still undeletable, attaching worktree to existing branch"
                );
                WorktreeAttach::ExistingBranch
            }
        }
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, repo_path: &Path, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        self.prune(repo_path, false);
    }
}

/// Slash-separated form without a trailing separator, for comparing paths
/// reported by git with paths supplied by callers on any platform.
pub fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() { s } else { trimmed.to_string() }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if let (Ok(ca), Ok(cb)) = (a.canonicalize(), b.canonicalize()) {
        return ca == cb;
    }
    normalize_path(a) == normalize_path(b)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Parse the porcelain output of `git worktree list --porcelain`.
///
/// The format consists of blocks separated by blank lines. Each block has:
///
/// ```text
/// worktree <path>
/// HEAD <sha>
/// branch refs/heads/<name>
/// ```
///
/// The main worktree may show `bare` instead of `branch`, detached
/// worktrees show `detached`, and entries whose directory is gone carry a
/// `prunable` line.
pub fn parse_porcelain_output(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            worktrees.extend(current.take());
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(WorktreeInfo {
                path: PathBuf::from(normalize_path(Path::new(rest))),
                branch: None,
                head_commit: String::new(),
                prunable: false,
            });
            continue;
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("HEAD ") {
            entry.head_commit = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("branch ") {
            entry.branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        } else if line == "prunable" || line.starts_with("prunable ") {
            entry.prunable = true;
        }
        // Ignore `bare`, `detached`, `locked`, etc.
    }

    // Porcelain output may not end with a blank line.
    worktrees.extend(current);
    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use corral_test_utils::TestRepo;

    use crate::command::scripted::ScriptedRunner;
    use crate::config::Timeouts;

    fn manager() -> WorktreeManager {
        WorktreeManager::new(Git::system())
    }

    #[test]
    fn test_create_and_list_worktree() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-create");

        let result = mgr
            .create_worktree(repo.path(), &wt_path, "agents/create")
            .expect("create_worktree failed");

        assert!(result.worktree_path.exists(), "worktree directory should exist");
        assert_eq!(result.attach, WorktreeAttach::NewBranch);
        assert_eq!(result.branch, "agents/create");

        let worktrees = mgr.list_worktrees(repo.path()).expect("list_worktrees failed");
        // Main worktree + our new one.
        assert!(worktrees.len() >= 2);
        assert!(
            worktrees
                .iter()
                .any(|wt| wt.branch.as_deref() == Some("agents/create"))
        );
        assert!(mgr.worktree_exists(repo.path(), &wt_path).unwrap());
    }

    #[test]
    fn test_create_worktree_retry_reuses_path_and_branch() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-retry");

        let first = mgr.create_worktree(repo.path(), &wt_path, "agents/retry").unwrap();
        std::fs::write(first.worktree_path.join("partial.txt"), "half done\n").unwrap();

        let second = mgr
            .create_worktree(repo.path(), &wt_path, "agents/retry")
            .expect("second create should clean up and succeed");

        assert_eq!(second.worktree_path, first.worktree_path);
        assert_eq!(second.attach, WorktreeAttach::NewBranch);
        assert!(!second.worktree_path.join("partial.txt").exists());
        assert!(mgr.is_valid_worktree(&second.worktree_path));
    }

    #[test]
    fn test_create_after_directory_deleted_externally() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-stale");

        mgr.create_worktree(repo.path(), &wt_path, "agents/stale").unwrap();
        std::fs::remove_dir_all(&wt_path).unwrap();

        let again = mgr.create_worktree(repo.path(), &wt_path, "agents/stale").unwrap();
        assert!(again.worktree_path.exists());
        assert_eq!(again.attach, WorktreeAttach::NewBranch);
    }

    #[test]
    fn test_create_over_plain_directory() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-plain");
        std::fs::create_dir_all(wt_path.join("junk")).unwrap();
        std::fs::write(wt_path.join("junk/file"), "x").unwrap();

        let result = mgr.create_worktree(repo.path(), &wt_path, "agents/plain").unwrap();
        assert!(!result.worktree_path.join("junk").exists());
        assert!(result.worktree_path.join("README.md").exists());
    }

    #[test]
    fn test_create_in_non_repo_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = manager()
            .create_worktree(dir.path(), &dir.path().join("wt"), "agents/x")
            .unwrap_err();
        assert!(matches!(err, WorktreeError::NotAGitRepo(_)));
    }

    #[test]
    fn test_undeletable_branch_attaches_existing() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .fail("branch -D")
                .respond("rev-parse --verify", "abc123"),
        );
        let mgr = WorktreeManager::new(Git::new(runner.clone(), Timeouts::default()));
        let dir = tempfile::TempDir::new().unwrap();
        let wt_path = dir.path().join("wt");

        let result = mgr
            .create_worktree(dir.path(), &wt_path, "agents/locked")
            .unwrap();

        assert_eq!(result.attach, WorktreeAttach::ExistingBranch);
        let calls = runner.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("branch -D")).count(), 2);
        assert!(calls.contains(&"worktree prune --expire now".to_string()));
        let add = calls.iter().find(|c| c.starts_with("worktree add")).unwrap();
        assert!(!add.contains(" -b "), "degraded path must not create a branch: {add}");
        assert!(add.ends_with("agents/locked"));
    }

    #[test]
    fn test_failed_create_cleans_partial_directory() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-main");

        // `main` is checked out in the main worktree: it can be neither
        // deleted nor checked out a second time.
        let err = mgr.create_worktree(repo.path(), &wt_path, "main").unwrap_err();
        assert!(matches!(err, WorktreeError::Create { .. }), "unexpected: {err}");
        assert!(!wt_path.exists(), "partial worktree directory should be cleaned up");
        assert!(repo.branch_exists("main"));
    }

    #[test]
    fn test_remove_worktree_and_branch() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-remove");
        mgr.create_worktree(repo.path(), &wt_path, "agents/remove").unwrap();

        let report = mgr
            .remove_worktree(repo.path(), &wt_path, Some("agents/remove"))
            .expect("remove failed");

        assert_eq!(report.path, RemovalPath::GitRemove);
        assert!(report.branch_deleted);
        assert!(!wt_path.exists());
        assert!(!repo.branch_exists("agents/remove"));
        assert!(!mgr.worktree_exists(repo.path(), &wt_path).unwrap());
    }

    #[test]
    fn test_remove_worktree_idempotent() {
        let repo = TestRepo::new();
        let mgr = manager();
        let wt_path = repo.scratch_path("wt-remove-twice");
        mgr.create_worktree(repo.path(), &wt_path, "agents/twice").unwrap();

        mgr.remove_worktree(repo.path(), &wt_path, Some("agents/twice"))
            .expect("first remove failed");
        let second = mgr
            .remove_worktree(repo.path(), &wt_path, Some("agents/twice"))
            .expect("second remove should not fail");
        assert_eq!(second.path, RemovalPath::Prune);
        assert!(!second.branch_deleted);
    }

    #[test]
    fn test_list_worktrees_includes_main() {
        let repo = TestRepo::new();
        let worktrees = manager().list_worktrees(repo.path()).expect("list failed");
        assert!(!worktrees.is_empty(), "should include at least the main worktree");
        assert!(worktrees.iter().any(|wt| same_path(&wt.path, repo.path())));
    }

    #[test]
    fn test_worktree_isolation() {
        let repo = TestRepo::new();
        let mgr = manager();
        let result = mgr
            .create_worktree(repo.path(), &repo.scratch_path("wt-iso"), "agents/iso")
            .unwrap();

        std::fs::write(result.worktree_path.join("agent-work.txt"), "agent output\n").unwrap();
        assert!(
            !repo.path().join("agent-work.txt").exists(),
            "file created in worktree should not appear in main repo"
        );
    }

    #[test]
    fn test_is_valid_worktree_rejects_full_clone() {
        let repo = TestRepo::new();
        let mgr = manager();
        assert!(!mgr.is_valid_worktree(repo.path()), "a .git directory is not a worktree");

        let result = mgr
            .create_worktree(repo.path(), &repo.scratch_path("wt-valid"), "agents/valid")
            .unwrap();
        assert!(mgr.is_valid_worktree(&result.worktree_path));
    }

    #[test]
    fn test_is_valid_worktree_rejects_dangling_pointer() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".git"), "gitdir: /nonexistent/.git/worktrees/x\n").unwrap();
        assert!(!manager().is_valid_worktree(dir.path()));
        assert!(!manager().is_valid_worktree(&dir.path().join("missing")));
    }

    #[test]
    fn test_parse_porcelain_output() {
        let input = "\
worktree /home/user/project
HEAD abc123def456
branch refs/heads/main

worktree /home/user/worktrees/feature
HEAD 789abc012def
branch refs/heads/agents/fix-login-bug

worktree /home/user/worktrees/detached
HEAD 111222333444
detached

worktree /home/user/worktrees/gone
HEAD 555666777888
branch refs/heads/agents/gone
prunable gitdir file points to non-existent location

";
        let result = parse_porcelain_output(input);
        assert_eq!(result.len(), 4);

        assert_eq!(result[0].path, PathBuf::from("/home/user/project"));
        assert_eq!(result[0].head_commit, "abc123def456");
        assert_eq!(result[0].branch.as_deref(), Some("main"));

        assert_eq!(result[1].branch.as_deref(), Some("agents/fix-login-bug"));
        assert!(!result[1].prunable);

        assert_eq!(result[2].branch, None);
        assert!(result[3].prunable);
    }

    #[test]
    fn test_parse_porcelain_output_no_trailing_newline() {
        let input = "worktree /home/user/project\nHEAD abc123\nbranch refs/heads/main";
        let result = parse_porcelain_output(input);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_parse_porcelain_output_normalizes_windows_paths() {
        let input = "worktree C:\\work\\repo\\\nHEAD abc\nbranch refs/heads/main\n";
        let result = parse_porcelain_output(input);
        assert_eq!(result[0].path, PathBuf::from("C:/work/repo"));
    }

    #[test]
    fn test_parse_porcelain_output_empty() {
        assert!(parse_porcelain_output("").is_empty());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("a\\b\\c\\")), "a/b/c");
        assert_eq!(normalize_path(Path::new("/tmp/x/")), "/tmp/x");
        assert_eq!(normalize_path(Path::new("/")), "/");
    }
}
