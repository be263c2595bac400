//! Reserved-filename scan run before staging.
//!
//! Agents occasionally create files named after device names (`nul`,
//! `con.txt`, `LPT1`) by redirecting output on the wrong platform. Windows
//! filesystems refuse those names, and a repository containing them cannot
//! be checked out there. Only paths git would stage are examined: untracked
//! and modified entries, with ignored trees (`target/`, `node_modules/`)
//! left out by git itself. The scan is purely name-based and fails open.

use std::collections::BTreeSet;
use std::path::Path;

use crate::git::{Git, parse_status};

/// Device names reserved on Windows, with or without an extension.
pub static RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Whether a single file name is a reserved device name.
pub fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    let stem = stem.trim_end_matches([' ', '.']).to_ascii_lowercase();
    RESERVED_NAMES.contains(&stem.as_str())
}

/// The leading part of `path` up to and including its first reserved
/// component, so a reserved directory is excluded as a whole.
pub fn reserved_prefix(path: &str) -> Option<String> {
    let mut prefix = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        prefix.push(component);
        if is_reserved_name(component) {
            return Some(prefix.join("/"));
        }
    }
    None
}

/// Relative paths (with `/` separators) that must be kept out of the index,
/// in sorted order without duplicates.
pub fn reserved_paths(git: &Git, root: &Path) -> Vec<String> {
    let status = match git.run(root, &["status", "--porcelain", "--untracked-files=all"]) {
        Ok(out) => parse_status(&out),
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "reserved-name scan skipped");
            return Vec::new();
        }
    };

    let paths: BTreeSet<String> = status
        .iter()
        .filter_map(|entry| reserved_prefix(&entry.path))
        .collect();
    if !paths.is_empty() {
        tracing::warn!(
            root = %root.display(),
            count = paths.len(),
            ?paths,
            "excluding reserved file names from staging"
        );
    }
    paths.into_iter().collect()
}

/// `git add` pathspecs: everything, minus the reserved entries.
pub fn staging_pathspecs(git: &Git, root: &Path) -> Vec<String> {
    let mut specs = vec![".".to_string()];
    specs.extend(
        reserved_paths(git, root)
            .into_iter()
            .map(|p| format!(":(exclude,literal){p}")),
    );
    specs
}
