//! Shared git plumbing: the [`Git`] handle every manager holds, a few
//! repository queries, git-dir resolution, and porcelain status parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandError, CommandRunner, GitCli};
use crate::config::Timeouts;

/// A command runner paired with the timeout budget for each kind of call.
#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl fmt::Debug for Git {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Git")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Git {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    /// The system `git` with default timeouts.
    pub fn system() -> Self {
        Self::new(Arc::new(GitCli::new()), Timeouts::default())
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Run with the default timeout.
    pub fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, CommandError> {
        self.runner.run(args, cwd, self.timeouts.default_timeout())
    }

    /// Run with the default timeout, keeping stdout byte-for-byte. Patches
    /// need this: a trailing context line may be a lone space.
    pub fn run_raw(&self, cwd: &Path, args: &[&str]) -> Result<String, CommandError> {
        self.runner.run_raw(args, cwd, self.timeouts.default_timeout())
    }

    pub fn run_with_timeout(
        &self,
        cwd: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CommandError> {
        self.runner.run(args, cwd, timeout)
    }

    /// Name of the checked-out branch (`HEAD` when detached).
    pub fn current_branch(&self, cwd: &Path) -> Result<String, CommandError> {
        self.run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|s| s.trim().to_string())
    }

    /// Something `git checkout` can return to: the branch name, or the
    /// commit when HEAD is detached.
    pub fn checkout_position(&self, cwd: &Path) -> Result<String, CommandError> {
        let branch = self.current_branch(cwd)?;
        if branch == "HEAD" {
            self.head_commit(cwd)
        } else {
            Ok(branch)
        }
    }

    pub fn head_commit(&self, cwd: &Path) -> Result<String, CommandError> {
        self.run(cwd, &["rev-parse", "HEAD"]).map(|s| s.trim().to_string())
    }

    /// Whether `refs/heads/<branch>` exists. Any failure reads as "no".
    pub fn branch_exists(&self, cwd: &Path, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.run(cwd, &["rev-parse", "--verify", "--quiet", &reference])
            .is_ok()
    }

    /// Branch that agent work is reconciled into: `main`, else `master`,
    /// else whatever the repository has checked out.
    pub fn base_branch(&self, repo_path: &Path) -> Result<String, CommandError> {
        for candidate in ["main", "master"] {
            if self.branch_exists(repo_path, candidate) {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch(repo_path)
    }

    /// Whether a remote called `name` is configured.
    pub fn has_remote(&self, cwd: &Path, name: &str) -> bool {
        match self.run(cwd, &["remote"]) {
            Ok(out) => out.lines().any(|l| l.trim() == name),
            Err(e) => {
                tracing::debug!(error = %e, "could not list remotes");
                false
            }
        }
    }

    /// Force-delete a local branch.
    pub fn delete_branch(&self, cwd: &Path, branch: &str) -> Result<(), CommandError> {
        self.run(cwd, &["branch", "-D", branch]).map(|_| ())
    }

    /// `git status --porcelain`, parsed.
    pub fn status(&self, cwd: &Path) -> Result<Vec<StatusEntry>, CommandError> {
        self.run(cwd, &["status", "--porcelain"])
            .map(|out| parse_status(&out))
    }
}

/// Locate the git directory for a working tree.
///
/// A main working tree has a `.git` directory. A linked worktree has a `.git`
/// file containing `gitdir: <path>`, which may be relative to the worktree.
pub fn resolve_git_dir(path: &Path) -> Option<PathBuf> {
    let dot_git = path.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    if dot_git.is_file() {
        return read_gitdir_pointer(&dot_git).map(|target| {
            if target.is_absolute() {
                target
            } else {
                path.join(target)
            }
        });
    }
    None
}

/// Read the target of a `.git` pointer file, as written.
pub fn read_gitdir_pointer(dot_git_file: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(dot_git_file).ok()?;
    let line = content.lines().find(|l| l.starts_with("gitdir:"))?;
    let target = line.trim_start_matches("gitdir:").trim();
    (!target.is_empty()).then(|| PathBuf::from(target))
}

/// One line of `git status --porcelain` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// The two-character `XY` status code.
    pub code: String,
    /// Path of the entry; for renames, the new path.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Parse one porcelain line: `XY <path>` or `XY <old> -> <new>`.
pub fn parse_status_line(line: &str) -> Option<StatusEntry> {
    let code = line.get(..2)?;
    let rest = line.get(3..)?;
    let path = match rest.split_once(" -> ") {
        Some((_, new)) => new,
        None => rest,
    };
    let path = unquote(path.trim());
    if path.is_empty() {
        return None;
    }
    Some(StatusEntry {
        code: code.to_string(),
        path,
    })
}

pub fn parse_status(output: &str) -> Vec<StatusEntry> {
    output.lines().filter_map(parse_status_line).collect()
}

// Porcelain wraps paths with unusual characters in double quotes.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .map(|p| p.replace("\\\"", "\"").replace("\\\\", "\\"))
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scripted::ScriptedRunner;

    #[test]
    fn parses_plain_status_lines() {
        let entries = parse_status(" M src/lib.rs\n?? notes.txt\nA  new.rs");
        assert_eq!(
            entries,
            vec![
                StatusEntry {
                    code: " M".into(),
                    path: "src/lib.rs".into()
                },
                StatusEntry {
                    code: "??".into(),
                    path: "notes.txt".into()
                },
                StatusEntry {
                    code: "A ".into(),
                    path: "new.rs".into()
                },
            ]
        );
        assert!(entries[1].is_untracked());
    }

    #[test]
    fn rename_takes_right_hand_side() {
        let entry = parse_status_line("R  old/name.rs -> new/name.rs").unwrap();
        assert_eq!(entry.path, "new/name.rs");
    }

    #[test]
    fn quoted_paths_are_unquoted() {
        let entry = parse_status_line("?? \"with space.txt\"").unwrap();
        assert_eq!(entry.path, "with space.txt");
    }

    #[test]
    fn short_lines_are_ignored() {
        assert!(parse_status_line("").is_none());
        assert!(parse_status_line("M").is_none());
        assert!(parse_status_line("?? ").is_none());
    }

    #[test]
    fn resolve_git_dir_follows_relative_pointer() {
        let dir = tempfile::TempDir::new().unwrap();
        let wt = dir.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        std::fs::write(wt.join(".git"), "gitdir: ../repo/.git/worktrees/wt\n").unwrap();
        assert_eq!(
            resolve_git_dir(&wt),
            Some(wt.join("../repo/.git/worktrees/wt"))
        );
    }

    #[test]
    fn resolve_git_dir_none_without_git_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(resolve_git_dir(dir.path()), None);
    }

    #[test]
    fn has_remote_matches_whole_names() {
        let runner = ScriptedRunner::new().respond("remote", "origin-mirror\nupstream");
        let git = Git::new(Arc::new(runner), Timeouts::default());
        assert!(!git.has_remote(Path::new("."), "origin"));
        assert!(git.has_remote(Path::new("."), "upstream"));
    }
}
