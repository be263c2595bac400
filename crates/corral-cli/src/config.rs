//! Configuration file management for corral.
//!
//! Provides a TOML-based config file at `~/.config/corral/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use corral_core::{Git, GitCli, SandboxConfig};

/// Default artifacts location, relative to the working directory. `.corral`
/// is a housekeeping name, so artifacts never make a tree dirty.
pub const DEFAULT_ARTIFACTS_DIR: &str = ".corral/artifacts";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Where `corral diff --persist` writes artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the corral config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/corral` or `~/.config/corral`,
/// never the platform-specific `dirs::config_dir()`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

/// Return the path to the corral config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct CorralConfig {
    pub sandbox: SandboxConfig,
    pub artifacts_dir: PathBuf,
}

impl CorralConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Namespace: `cli_namespace` > `CORRAL_NAMESPACE` env > `sandbox.namespace` > `default-namespace`
    /// - Artifacts dir: `cli_artifacts_dir` > `CORRAL_ARTIFACTS_DIR` env > `artifacts_dir` > `.corral/artifacts`
    ///
    /// A missing config file is fine; an unparseable one is an error.
    pub fn resolve(cli_namespace: Option<&str>, cli_artifacts_dir: Option<&Path>) -> Result<Self> {
        let file_config = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };

        let mut sandbox = file_config.sandbox;
        if let Some(ns) = cli_namespace {
            sandbox.namespace = ns.to_string();
        } else if let Some(ns) = env_nonempty("CORRAL_NAMESPACE") {
            sandbox.namespace = ns;
        }

        let artifacts_dir = if let Some(dir) = cli_artifacts_dir {
            dir.to_path_buf()
        } else if let Some(dir) = env_nonempty("CORRAL_ARTIFACTS_DIR") {
            PathBuf::from(dir)
        } else if let Some(dir) = file_config.artifacts_dir {
            dir
        } else {
            PathBuf::from(DEFAULT_ARTIFACTS_DIR)
        };

        tracing::debug!(namespace = %sandbox.namespace, artifacts = %artifacts_dir.display(), "resolved config");
        Ok(Self {
            sandbox,
            artifacts_dir,
        })
    }

    /// A git handle using the configured timeouts.
    pub fn git(&self) -> Git {
        Git::new(Arc::new(GitCli::new()), self.sandbox.timeouts)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
