//! Shared test utilities for corral integration tests.
//!
//! Every fixture is a real git repository living in a temporary directory.
//! The repository starts on `main` with a single commit containing
//! `README.md`, and has a local identity configured so commits work on
//! machines without a global git config.
//!
//! A second temporary directory (`scratch`) is kept alongside the repo so
//! tests can place worktrees, bare remotes and artifact directories outside
//! the working tree.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run git in `dir` and return its output without checking the status.
pub fn git_output(dir: &Path, args: &[&str]) -> Output {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {}: {e}", args.join(" ")))
}

/// Run git in `dir`, panic unless it succeeds, and return trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = git_output(dir, args);
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A temporary git repository plus a scratch directory for siblings.
pub struct TestRepo {
    dir: TempDir,
    scratch: TempDir,
    path: PathBuf,
}

impl TestRepo {
    /// Create a repository on `main` with an initial commit.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let scratch = TempDir::new().expect("failed to create scratch dir");
        let path = dir.path().to_path_buf();

        git(&path, &["init"]);
        // Pin the initial branch name regardless of init.defaultBranch.
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@corral.dev"]);
        git(&path, &["config", "user.name", "Corral Test"]);
        git(&path, &["config", "commit.gpgsign", "false"]);

        std::fs::write(path.join("README.md"), "# Test repo\n").expect("failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { dir, scratch, path }
    }

    /// Path of the main working tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the temporary directory holding the repository.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// A path inside the scratch directory (not created).
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    /// Run git in the main working tree, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        git(&self.path, args)
    }

    /// Write a file relative to the main working tree, creating parents.
    pub fn write(&self, relative: &str, contents: &str) {
        write_file(&self.path, relative, contents);
    }

    /// Stage everything and commit in the main working tree.
    pub fn commit_all(&self, message: &str) {
        commit_all(&self.path, message);
    }

    /// Branch currently checked out in the main working tree.
    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Whether `refs/heads/<branch>` exists.
    pub fn branch_exists(&self, branch: &str) -> bool {
        git_output(
            &self.path,
            &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
        )
        .status
        .success()
    }

    /// Create a bare repository in scratch, register it as `origin`, and
    /// push `main` to it. Returns the bare repository path.
    pub fn add_bare_remote(&self) -> PathBuf {
        let remote = self.scratch_path("remote.git");
        std::fs::create_dir_all(&remote).expect("failed to create remote dir");
        git(&remote, &["init", "--bare"]);
        let remote_str = remote.to_string_lossy().to_string();
        self.git(&["remote", "add", "origin", &remote_str]);
        self.git(&["push", "-u", "origin", "main"]);
        remote
    }

    /// Create `branch` from `main` with `file` set to `branch_contents`, then
    /// return to `main` and commit `main_contents` to the same file. Merging
    /// the two afterwards conflicts on `file`.
    pub fn diverge(&self, branch: &str, file: &str, branch_contents: &str, main_contents: &str) {
        self.git(&["checkout", "-b", branch]);
        self.write(file, branch_contents);
        self.commit_all(&format!("{branch} edits {file}"));
        self.git(&["checkout", "main"]);
        self.write(file, main_contents);
        self.commit_all(&format!("main edits {file}"));
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `contents` to `dir/relative`, creating parent directories.
pub fn write_file(dir: &Path, relative: &str, contents: &str) {
    let target = dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).expect("failed to create parent dirs");
    }
    std::fs::write(&target, contents)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", target.display()));
}

/// Stage everything in `dir` and commit.
pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}
