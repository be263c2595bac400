//! Sandbox configuration: branch namespace, git timeouts and the
//! housekeeping allow-list consulted by the clean-check.
//!
//! Everything here is plain serde data so the CLI can load it from TOML;
//! every field has a default, so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Branch prefix used when a job does not supply its own.
pub const DEFAULT_NAMESPACE: &str = "default-namespace";

/// Files the agent tooling itself writes into a working tree. Their presence
/// does not make a working directory dirty.
pub const DEFAULT_HOUSEKEEPING_FILES: &[&str] = &[
    ".corral",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    ".claude",
    "CLAUDE.local.md",
];

/// Top-level sandbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Prefix for generated branch names (`<namespace>/<slug>`).
    pub namespace: String,
    /// Name of the remote consulted by push/reconcile.
    pub remote: String,
    /// Per-operation git timeouts.
    pub timeouts: Timeouts,
    /// Names ignored by the clean-check, matched against whole paths or
    /// their final component.
    pub housekeeping_files: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            remote: "origin".to_string(),
            timeouts: Timeouts::default(),
            housekeeping_files: DEFAULT_HOUSEKEEPING_FILES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Timeouts in seconds. Pull is kept short because a pull that needs
/// credentials would otherwise sit on a prompt until killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub default_secs: u64,
    pub pull_secs: u64,
    pub push_secs: u64,
    pub worktree_push_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default_secs: 30,
            pull_secs: 10,
            push_secs: 60,
            worktree_push_secs: 120,
        }
    }
}

impl Timeouts {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs.max(1))
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs.max(1))
    }

    pub fn push(&self) -> Duration {
        Duration::from_secs(self.push_secs.max(1))
    }

    pub fn worktree_push(&self) -> Duration {
        Duration::from_secs(self.worktree_push_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let t = Timeouts::default();
        assert_eq!(t.default_timeout(), Duration::from_secs(30));
        assert_eq!(t.pull(), Duration::from_secs(10));
        assert_eq!(t.push(), Duration::from_secs(60));
        assert_eq!(t.worktree_push(), Duration::from_secs(120));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: SandboxConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, SandboxConfig::default());
        assert_eq!(cfg.namespace, DEFAULT_NAMESPACE);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: SandboxConfig = toml::from_str(
            r#"
namespace = "agents"

[timeouts]
pull_secs = 3
"#,
        )
        .unwrap();
        assert_eq!(cfg.namespace, "agents");
        assert_eq!(cfg.remote, "origin");
        assert_eq!(cfg.timeouts.pull_secs, 3);
        assert_eq!(cfg.timeouts.push_secs, 60);
    }

    #[test]
    fn zero_timeouts_are_clamped() {
        let t = Timeouts {
            default_secs: 0,
            pull_secs: 0,
            push_secs: 0,
            worktree_push_secs: 0,
        };
        assert_eq!(t.pull(), Duration::from_secs(1));
    }
}
