//! Branch-mode sandboxes.
//!
//! A sandbox is a fresh branch in the user's existing working directory,
//! cut from an up-to-date base branch. It is the single-workspace
//! alternative to [`crate::worktree`]: cheaper, but only one job at a time.
//!
//! ```text
//! clean-check -> checkout base -> pull -> checkout -b <branch>
//!     (agent works)
//! push | discard
//! ```
//!
//! Passing `skip_clean_check` is the retry path: a job that failed halfway
//! re-enters with its partial work still in the tree.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;
use crate::config::SandboxConfig;
use crate::diff::{DiffCapture, DiffError, DiffResult};
use crate::fallback::FallbackChain;
use crate::git::Git;
use crate::reconcile::{PushMergeCoordinator, PushOutcome, ReconcileError};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Git(#[from] CommandError),

    #[error("working directory not clean: {}", .files.join(", "))]
    NotClean { files: Vec<String> },

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("failed to discard sandbox in {path}: {detail}")]
    DiscardFailed { path: String, detail: String },
}

/// Which base branch the sandbox was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseCheckout {
    Main,
    Master,
    /// Neither `main` nor `master` could be checked out; the sandbox starts
    /// from whatever was checked out before.
    Current,
}

/// Where [`SandboxLifecycleManager::discard`] left the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnTo {
    Previous,
    Main,
    Master,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxResult {
    pub branch: String,
    pub previous_branch: String,
    /// Whether the working directory was clean when the sandbox was entered.
    pub clean: bool,
    /// `None` on the retry path, which never checks out a base branch.
    pub base: Option<BaseCheckout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscardReport {
    pub reset: bool,
    pub returned_to: Option<ReturnTo>,
    pub checked_out: Option<String>,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxLifecycleManager {
    git: Git,
    config: SandboxConfig,
    diff: DiffCapture,
    coordinator: PushMergeCoordinator,
}

impl SandboxLifecycleManager {
    pub fn new(git: Git, config: SandboxConfig) -> Self {
        Self {
            diff: DiffCapture::new(git.clone()),
            coordinator: PushMergeCoordinator::new(git.clone(), &config),
            git,
            config,
        }
    }

    /// Replace the coordinator used by [`Self::push`], e.g. to attach a
    /// change-request publisher.
    pub fn with_coordinator(mut self, coordinator: PushMergeCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Entries of `git status` that are not housekeeping files.
    pub fn dirty_files(&self, path: &Path) -> Result<Vec<String>, SandboxError> {
        Ok(self
            .git
            .status(path)?
            .into_iter()
            .map(|entry| entry.path)
            .filter(|p| !self.is_housekeeping(p))
            .collect())
    }

    /// True iff the working tree has no changes besides housekeeping files.
    /// A failing status query counts as not clean.
    pub fn is_clean(&self, path: &Path) -> bool {
        match self.dirty_files(path) {
            Ok(files) => files.is_empty(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "status failed, treating as dirty");
                false
            }
        }
    }

    fn is_housekeeping(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        let name = path.rsplit('/').next().unwrap_or(path);
        self.config
            .housekeeping_files
            .iter()
            .any(|h| h == path || h == name)
    }

    /// Cut `branch` from a freshly pulled base branch.
    ///
    /// # Errors
    ///
    /// [`SandboxError::NotClean`] unless `skip_clean_check` is set, or a git
    /// error if the branch cannot be created.
    pub fn create_sandbox(
        &self,
        path: &Path,
        branch: &str,
        skip_clean_check: bool,
    ) -> Result<SandboxResult, SandboxError> {
        let clean = if skip_clean_check {
            self.is_clean(path)
        } else {
            let files = self.dirty_files(path)?;
            if !files.is_empty() {
                return Err(SandboxError::NotClean { files });
            }
            true
        };

        let previous_branch = self.git.checkout_position(path)?;

        let checkout = |name: &'static str| move || self.git.run(path, &["checkout", name]).map(|_| ());
        let base = match FallbackChain::new("checkout base branch")
            .then(BaseCheckout::Main, checkout("main"))
            .then(BaseCheckout::Master, checkout("master"))
            .run()
        {
            Ok((tag, ())) => tag,
            Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    current = %previous_branch,
                    "no main or master branch, staying on current branch"
                );
                BaseCheckout::Current
            }
        };

        self.pull(path);

        self.git.run(path, &["checkout", "-b", branch])?;
        tracing::info!(
            path = %path.display(),
            branch,
            previous = %previous_branch,
            ?base,
            "created sandbox branch"
        );

        Ok(SandboxResult {
            branch: branch.to_string(),
            previous_branch,
            clean,
            base: Some(base),
        })
    }

    /// Re-enter an existing sandbox branch without pulling or creating.
    pub fn checkout_existing_branch(&self, path: &Path, branch: &str) -> Result<SandboxResult, SandboxError> {
        let previous_branch = self.git.checkout_position(path)?;
        self.git.run(path, &["checkout", branch])?;
        tracing::info!(path = %path.display(), branch, "checked out existing sandbox branch");
        Ok(SandboxResult {
            branch: branch.to_string(),
            previous_branch,
            clean: self.is_clean(path),
            base: None,
        })
    }

    /// Throw away every change: tracked edits are reset and untracked files
    /// removed. Running it twice is a no-op the second time.
    pub fn reset_and_clean(&self, path: &Path) -> Result<(), SandboxError> {
        self.git.run(path, &["reset", "--hard", "HEAD"])?;
        if let Err(e) = self.git.run(path, &["clean", "-fd"]) {
            tracing::warn!(path = %path.display(), error = %e, "git clean failed");
        }
        Ok(())
    }

    pub fn capture_diff(&self, path: &Path) -> Result<DiffResult, SandboxError> {
        Ok(self.diff.capture(path)?)
    }

    pub fn generate_patch(&self, path: &Path, base: Option<&str>) -> Result<String, SandboxError> {
        Ok(self.diff.generate_patch(path, base)?)
    }

    pub fn push(&self, path: &Path, branch: &str, message: &str) -> Result<PushOutcome, SandboxError> {
        Ok(self.coordinator.push(path, branch, message)?)
    }

    /// Abandon a sandbox: reset and clean, return to `previous_branch` (else
    /// `main`, else `master`), then delete `branch`.
    ///
    /// Each step is attempted regardless of the others. An error is returned
    /// only if both the reset and the checkout failed, leaving the tree in
    /// an unknown state.
    pub fn discard(
        &self,
        path: &Path,
        branch: &str,
        previous_branch: Option<&str>,
    ) -> Result<DiscardReport, SandboxError> {
        let reset_error = self.reset_and_clean(path).err();
        if let Some(e) = &reset_error {
            tracing::warn!(path = %path.display(), error = %e, "reset before discard failed");
        }

        let checkout = |name: &str| {
            self.git
                .run(path, &["checkout", name])
                .map(|_| name.to_string())
        };
        let mut chain = FallbackChain::new("return from sandbox");
        // A literal "HEAD" would check out the sandbox branch itself.
        if let Some(previous) =
            previous_branch.filter(|p| *p != branch && *p != "HEAD" && !p.is_empty())
        {
            chain = chain.then(ReturnTo::Previous, move || checkout(previous));
        }
        let returned = chain
            .then(ReturnTo::Main, move || checkout("main"))
            .then(ReturnTo::Master, move || checkout("master"))
            .run();

        let (returned_to, checked_out) = match returned {
            Ok((tag, name)) => (Some(tag), Some(name)),
            Err(exhausted) => {
                if let Some(reset_error) = &reset_error {
                    return Err(SandboxError::DiscardFailed {
                        path: path.display().to_string(),
                        detail: format!("{reset_error}; {exhausted}"),
                    });
                }
                tracing::warn!(path = %path.display(), error = %exhausted, "could not leave sandbox branch");
                (None, None)
            }
        };

        let branch_deleted = match self.git.delete_branch(path, branch) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(branch, error = %e, "sandbox branch not deleted");
                false
            }
        };

        tracing::info!(path = %path.display(), branch, ?returned_to, branch_deleted, "discarded sandbox");
        Ok(DiscardReport {
            reset: reset_error.is_none(),
            returned_to,
            checked_out,
            branch_deleted,
        })
    }

    fn pull(&self, path: &Path) {
        match self
            .git
            .run_with_timeout(path, &["pull", "--ff-only"], self.git.timeouts().pull())
        {
            Ok(_) => tracing::debug!(path = %path.display(), "pulled base branch"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                timed_out = e.is_timeout(),
                error = %e,
                "pull failed, continuing with local base"
            ),
        }
    }
}
