//! Merge-conflict detection and resolution.
//!
//! ```text
//! NO_MERGE -> MERGE_IN_PROGRESS -> ALL_RESOLVED -> COMMITTED
//!                               \-> ABORTED
//! ```
//!
//! The merge-in-progress state is git's own `MERGE_HEAD` marker; nothing is
//! cached here. Every [`ConflictInfo`] describes the repository at the moment
//! it was read and is stale once the merge is resolved or aborted.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandError;
use crate::fallback::FallbackChain;
use crate::git::{Git, resolve_git_dir};

/// Maximum number of lines shown for the first conflict region.
pub const PREVIEW_MAX_LINES: usize = 30;

pub const DEFAULT_OURS_LABEL: &str = "current";
pub const DEFAULT_THEIRS_LABEL: &str = "incoming";

static MERGE_MSG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Merge (?:remote-tracking )?branch '([^']+)'(?: of \S+)?(?: into (\S+))?")
        .expect("merge message pattern is valid")
});

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error(transparent)]
    Git(#[from] CommandError),

    #[error("cannot complete merge, unresolved conflicts remain in: {}", .files.join(", "))]
    Unresolved { files: Vec<String> },

    #[error("could not abort merge in {path}: {detail}")]
    AbortFailed { path: String, detail: String },
}

/// Which side wins for a conflicting file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Ours,
    Theirs,
}

impl Strategy {
    fn checkout_flag(self) -> &'static str {
        match self {
            Self::Ours => "--ours",
            Self::Theirs => "--theirs",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            other => Err(format!("unknown strategy {other:?} (expected \"ours\" or \"theirs\")")),
        }
    }
}

/// A file currently in conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub file_path: String,
    /// First conflict region, marker to marker, capped at
    /// [`PREVIEW_MAX_LINES`], plus a note when more regions follow.
    pub preview: String,
    pub ours_label: String,
    pub theirs_label: String,
    /// Number of conflict regions in the file.
    pub conflict_count: usize,
}

/// Result of [`ConflictResolver::start_merge_for_resolution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeStart {
    /// The base merged without conflicts and was committed.
    Clean { base: String },
    /// A merge is now in progress with these conflicting files.
    Conflicts { base: String, files: Vec<String> },
}

/// Which step of the abort chain restored the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPath {
    MergeAbort,
    HardReset,
}

/// Result of [`ConflictResolver::complete_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeCommit {
    Committed,
    /// There was nothing left to commit; the merge was already concluded.
    AlreadyCommitted,
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    git: Git,
}

impl ConflictResolver {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Whether a merge is in progress in `path`, following a worktree's
    /// `.git` pointer file to its own git directory.
    pub fn is_in_merge_conflict(&self, path: &Path) -> bool {
        resolve_git_dir(path).is_some_and(|dir| dir.join("MERGE_HEAD").exists())
    }

    /// Files git reports as unmerged right now.
    pub fn get_conflicting_files(&self, path: &Path) -> Result<Vec<String>, ConflictError> {
        let out = self
            .git
            .run(path, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Merge the repository's base branch (`main`, else `master`, else its
    /// checked-out branch) into the worktree's branch so conflicts surface
    /// for interactive resolution. This is the branch a local reconcile
    /// merges into, so the conflicts it reported are the ones surfaced here.
    pub fn start_merge_for_resolution(
        &self,
        worktree_path: &Path,
        repo_path: &Path,
    ) -> Result<MergeStart, ConflictError> {
        let base = self.git.base_branch(repo_path)?;
        tracing::info!(
            worktree = %worktree_path.display(),
            base = %base,
            "merging base into worktree to surface conflicts"
        );

        match self.git.run(worktree_path, &["merge", "--no-edit", &base]) {
            Ok(_) => Ok(MergeStart::Clean { base }),
            Err(e) => {
                let files = self.get_conflicting_files(worktree_path)?;
                if files.is_empty() {
                    return Err(e.into());
                }
                tracing::info!(count = files.len(), "merge stopped on conflicts");
                Ok(MergeStart::Conflicts { base, files })
            }
        }
    }

    /// Describe every conflicting file in `worktree_path`.
    pub fn get_conflict_details(&self, worktree_path: &Path) -> Result<Vec<ConflictInfo>, ConflictError> {
        let files = self.get_conflicting_files(worktree_path)?;
        let (ours_label, theirs_label) = self.branch_labels(worktree_path);

        Ok(files
            .into_iter()
            .map(|file| {
                let (preview, conflict_count) =
                    match std::fs::read(worktree_path.join(&file)) {
                        Ok(bytes) => conflict_preview(&String::from_utf8_lossy(&bytes)),
                        Err(e) => {
                            tracing::debug!(file = %file, error = %e, "conflicting file unreadable");
                            ("(file deleted on one side)".to_string(), 0)
                        }
                    };
                ConflictInfo {
                    file_path: file,
                    preview,
                    ours_label: ours_label.clone(),
                    theirs_label: theirs_label.clone(),
                    conflict_count,
                }
            })
            .collect())
    }

    /// Take one side for `file` and stage it.
    pub fn resolve_conflict(&self, path: &Path, file: &str, strategy: Strategy) -> Result<(), ConflictError> {
        self.git
            .run(path, &["checkout", strategy.checkout_flag(), "--", file])?;
        self.git.run(path, &["add", "--", file])?;
        tracing::info!(file, ?strategy, "resolved conflict");
        Ok(())
    }

    /// Resolve every conflicting file with the same strategy. Returns the
    /// files resolved, in the order git listed them.
    pub fn resolve_all_conflicts(&self, path: &Path, strategy: Strategy) -> Result<Vec<String>, ConflictError> {
        let files = self.get_conflicting_files(path)?;
        for file in &files {
            self.resolve_conflict(path, file, strategy)?;
        }
        Ok(files)
    }

    /// Abort the merge; if git cannot, hard-reset to the pre-merge head.
    pub fn abort_merge(&self, path: &Path) -> Result<AbortPath, ConflictError> {
        FallbackChain::new("abort merge")
            .then(AbortPath::MergeAbort, || {
                self.git.run(path, &["merge", "--abort"]).map(|_| ())
            })
            .then(AbortPath::HardReset, || {
                self.git.run(path, &["reset", "--hard", "HEAD"]).map(|_| ())
            })
            .run()
            .map(|(tag, ())| tag)
            .map_err(|exhausted| ConflictError::AbortFailed {
                path: path.display().to_string(),
                detail: exhausted.to_string(),
            })
    }

    /// Commit the merge once every conflict is resolved.
    pub fn complete_merge(&self, path: &Path, message: Option<&str>) -> Result<MergeCommit, ConflictError> {
        let remaining = self.get_conflicting_files(path)?;
        if !remaining.is_empty() {
            return Err(ConflictError::Unresolved { files: remaining });
        }

        let result = match message {
            Some(msg) => self.git.run(path, &["commit", "-m", msg]),
            None => self.git.run(path, &["commit", "--no-edit"]),
        };

        match result {
            Ok(_) => Ok(MergeCommit::Committed),
            Err(e) if is_nothing_to_commit(&e) => {
                tracing::info!(path = %path.display(), "merge already committed");
                Ok(MergeCommit::AlreadyCommitted)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ours/theirs labels from `MERGE_MSG`, or the generic defaults.
    fn branch_labels(&self, path: &Path) -> (String, String) {
        let message = resolve_git_dir(path)
            .and_then(|dir| std::fs::read_to_string(dir.join("MERGE_MSG")).ok());
        let current = self.git.current_branch(path).ok();
        labels_from_merge_message(message.as_deref(), current.as_deref())
    }
}

fn is_nothing_to_commit(err: &CommandError) -> bool {
    let out = err.output();
    out.contains("nothing to commit") || out.contains("no changes added to commit")
}

/// Parse `Merge branch 'x' into y`. Ours falls back to the checked-out
/// branch, then to [`DEFAULT_OURS_LABEL`].
pub fn labels_from_merge_message(message: Option<&str>, current_branch: Option<&str>) -> (String, String) {
    let current = current_branch
        .filter(|b| !b.is_empty() && *b != "HEAD")
        .unwrap_or(DEFAULT_OURS_LABEL);

    let Some(caps) = message
        .and_then(|m| m.lines().next())
        .and_then(|line| MERGE_MSG_RE.captures(line.trim()))
    else {
        return (DEFAULT_OURS_LABEL.to_string(), DEFAULT_THEIRS_LABEL.to_string());
    };

    let theirs = caps
        .get(1)
        .map_or(DEFAULT_THEIRS_LABEL, |m| m.as_str())
        .to_string();
    let ours = caps.get(2).map_or(current, |m| m.as_str()).to_string();
    (ours, theirs)
}

/// First conflict region of `content` and the total region count.
pub fn conflict_preview(content: &str) -> (String, usize) {
    let mut count = 0;
    let mut in_first = false;
    let mut first_done = false;
    let mut region: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.starts_with("<<<<<<<") {
            count += 1;
            if count == 1 {
                in_first = true;
            }
        }
        if in_first && !first_done {
            region.push(line);
            if line.starts_with(">>>>>>>") {
                in_first = false;
                first_done = true;
            }
        }
    }

    if count == 0 {
        return (String::new(), 0);
    }

    let mut preview = if region.len() > PREVIEW_MAX_LINES {
        let hidden = region.len() - PREVIEW_MAX_LINES;
        let mut shown = region[..PREVIEW_MAX_LINES].join("\n");
        shown.push_str(&format!("\n... ({hidden} more lines)"));
        shown
    } else {
        region.join("\n")
    };

    if count > 1 {
        let more = count - 1;
        let noun = if more == 1 { "conflict" } else { "conflicts" };
        preview.push_str(&format!("\n... and {more} more {noun} in this file"));
    }

    (preview, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::command::scripted::ScriptedRunner;
    use crate::config::Timeouts;

    const TWO_CONFLICTS: &str = "\
header
<<<<<<< HEAD
ours line
=======
theirs line
>>>>>>> feature
middle
<<<<<<< HEAD
second ours
=======
second theirs
>>>>>>> feature
";

    #[test]
    fn preview_holds_only_first_region_and_counts_the_rest() {
        let (preview, count) = conflict_preview(TWO_CONFLICTS);
        assert_eq!(count, 2);
        assert!(preview.starts_with("<<<<<<< HEAD\nours line\n=======\ntheirs line\n>>>>>>> feature"));
        assert!(!preview.contains("second ours"));
        assert!(preview.ends_with("... and 1 more conflict in this file"));
    }

    #[test]
    fn preview_is_capped() {
        let mut content = String::from("<<<<<<< HEAD\n");
        for i in 0..50 {
            content.push_str(&format!("line {i}\n"));
        }
        content.push_str("=======\n>>>>>>> other\n");
        let (preview, count) = conflict_preview(&content);
        assert_eq!(count, 1);
        assert_eq!(preview.lines().count(), PREVIEW_MAX_LINES + 1);
        assert!(preview.ends_with("more lines)"));
    }

    #[test]
    fn no_markers_means_no_preview() {
        assert_eq!(conflict_preview("plain\ntext\n"), (String::new(), 0));
    }

    #[test]
    fn unterminated_region_is_kept() {
        let (preview, count) = conflict_preview("<<<<<<< HEAD\nonly ours\n");
        assert_eq!(count, 1);
        assert_eq!(preview, "<<<<<<< HEAD\nonly ours");
    }

    #[test]
    fn labels_parse_merge_message() {
        assert_eq!(
            labels_from_merge_message(Some("Merge branch 'main' into agents/fix-bug\n\n# Conflicts:\n"), None),
            ("agents/fix-bug".to_string(), "main".to_string())
        );
        assert_eq!(
            labels_from_merge_message(Some("Merge branch 'main'\n"), Some("agents/fix-bug")),
            ("agents/fix-bug".to_string(), "main".to_string())
        );
    }

    #[test]
    fn labels_default_without_message() {
        assert_eq!(
            labels_from_merge_message(None, Some("feature")),
            ("current".to_string(), "incoming".to_string())
        );
        assert_eq!(
            labels_from_merge_message(Some("Squashed commit"), None),
            ("current".to_string(), "incoming".to_string())
        );
    }

    #[test]
    fn strategy_parses_from_str() {
        assert_eq!("ours".parse::<Strategy>().unwrap(), Strategy::Ours);
        assert_eq!("theirs".parse::<Strategy>().unwrap(), Strategy::Theirs);
        assert!("both".parse::<Strategy>().is_err());
    }

    #[test]
    fn abort_falls_back_to_hard_reset() {
        let runner = Arc::new(ScriptedRunner::new().fail("merge --abort"));
        let resolver = ConflictResolver::new(Git::new(runner.clone(), Timeouts::default()));
        let path = resolver.abort_merge(Path::new(".")).unwrap();
        assert_eq!(path, AbortPath::HardReset);
        assert_eq!(runner.calls(), vec!["merge --abort", "reset --hard HEAD"]);
    }

    #[test]
    fn abort_fails_when_both_tiers_fail() {
        let runner = Arc::new(ScriptedRunner::new().fail("merge --abort").fail("reset"));
        let resolver = ConflictResolver::new(Git::new(runner, Timeouts::default()));
        let err = resolver.abort_merge(Path::new(".")).unwrap_err();
        assert!(matches!(err, ConflictError::AbortFailed { .. }));
    }

    #[test]
    fn complete_merge_names_every_unresolved_file() {
        let runner = Arc::new(ScriptedRunner::new().respond("diff --name-only --diff-filter=U", "a.rs\nb/c.rs"));
        let resolver = ConflictResolver::new(Git::new(runner.clone(), Timeouts::default()));
        let err = resolver.complete_merge(Path::new("."), None).unwrap_err();
        match &err {
            ConflictError::Unresolved { files } => assert_eq!(files, &vec!["a.rs".to_string(), "b/c.rs".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("a.rs, b/c.rs"));
        assert!(!runner.calls().iter().any(|c| c.starts_with("commit")));
    }
}
