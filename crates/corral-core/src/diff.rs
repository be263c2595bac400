//! Diff capture: the agent's uncommitted work as a unified patch plus a
//! changed-file list, persisted as artifacts for reporting UIs.
//!
//! Artifact layout (a compatibility surface):
//!
//! ```text
//! <artifacts>/git/diff.patch          raw unified diff
//! <artifacts>/git/changed-files.json  JSON array of paths
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandError;
use crate::git::Git;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Git(#[from] CommandError),

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode changed files: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Combined unstaged + staged diff of a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub patch: String,
    /// Changed paths in first-seen order, without duplicates.
    pub changed_files: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty() && self.changed_files.is_empty()
    }
}

/// Where [`DiffCapture::persist`] wrote its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub patch: PathBuf,
    pub changed_files: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DiffCapture {
    git: Git,
}

impl DiffCapture {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Read the unstaged and staged diffs of `path`. Read-only.
    pub fn capture(&self, path: &Path) -> Result<DiffResult, DiffError> {
        // Each half already ends in a newline; concatenating keeps both
        // applicable with `git apply`.
        let mut patch = self.git.run_raw(path, &["diff"])?;
        patch.push_str(&self.git.run_raw(path, &["diff", "--cached"])?);

        let mut changed_files = Vec::new();
        for listing in [
            self.git.run(path, &["diff", "--name-only"])?,
            self.git.run(path, &["diff", "--cached", "--name-only"])?,
        ] {
            for file in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !changed_files.iter().any(|f| f == file) {
                    changed_files.push(file.to_string());
                }
            }
        }

        tracing::debug!(
            path = %path.display(),
            files = changed_files.len(),
            bytes = patch.len(),
            "captured diff"
        );
        Ok(DiffResult {
            patch,
            changed_files,
        })
    }

    /// A patch of the working tree against `HEAD`, or against `base` when
    /// given (which then also includes committed work on the branch).
    pub fn generate_patch(&self, path: &Path, base: Option<&str>) -> Result<String, DiffError> {
        let against = base.unwrap_or("HEAD");
        Ok(self.git.run_raw(path, &["diff", against])?)
    }

    /// Write `diff` under `<artifacts_dir>/git/`.
    pub fn persist(&self, diff: &DiffResult, artifacts_dir: &Path) -> Result<ArtifactPaths, DiffError> {
        let dir = artifacts_dir.join("git");
        std::fs::create_dir_all(&dir).map_err(|source| DiffError::Write {
            path: dir.clone(),
            source,
        })?;

        let patch_path = dir.join("diff.patch");
        let mut patch = diff.patch.clone();
        if !patch.is_empty() && !patch.ends_with('\n') {
            patch.push('\n');
        }
        std::fs::write(&patch_path, patch).map_err(|source| DiffError::Write {
            path: patch_path.clone(),
            source,
        })?;

        let files_path = dir.join("changed-files.json");
        let json = serde_json::to_string_pretty(&diff.changed_files)?;
        std::fs::write(&files_path, json).map_err(|source| DiffError::Write {
            path: files_path.clone(),
            source,
        })?;

        tracing::info!(dir = %dir.display(), "wrote diff artifacts");
        Ok(ArtifactPaths {
            patch: patch_path,
            changed_files: files_path,
        })
    }

    /// Capture and persist in one step.
    pub fn capture_to(&self, path: &Path, artifacts_dir: &Path) -> Result<(DiffResult, ArtifactPaths), DiffError> {
        let diff = self.capture(path)?;
        let paths = self.persist(&diff, artifacts_dir)?;
        Ok((diff, paths))
    }
}
