//! Branch-name synthesis.
//!
//! Turns a free-text job summary into a short, readable slug under a
//! namespace, e.g. `"Please fix the login bug"` becomes
//! `default-namespace/fix-login-bug`. The result is deterministic for a
//! given input and only ever contains `[a-z0-9-]` after the namespace.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_NAMESPACE;

/// Maximum number of summary words kept in the slug.
pub const MAX_WORDS: usize = 5;
/// Maximum slug length in characters.
pub const MAX_SLUG_LEN: usize = 30;
/// Number of job-id characters used when the summary yields nothing.
pub const JOB_ID_PREFIX_LEN: usize = 8;

/// Words that carry no meaning in a branch name: articles, pronouns, modal
/// verbs, prepositions and filler.
pub static STOP_WORDS: &[&str] = &[
    // articles
    "a", "an", "the",
    // pronouns
    "i", "me", "my", "mine", "we", "us", "our", "you", "your", "he", "him", "his", "she", "her",
    "it", "its", "they", "them", "their", "this", "that", "these", "those",
    // modal and auxiliary verbs
    "can", "could", "would", "should", "will", "shall", "may", "might", "must", "do", "does",
    "is", "are", "was", "be", "been",
    // connectives and prepositions
    "and", "or", "but", "to", "of", "in", "on", "for", "with", "at", "by", "from", "so",
    // filler
    "please", "just", "some", "any", "really", "very", "also", "maybe", "kindly", "quick",
    "quickly", "simple", "small", "little", "nice", "good", "new",
];

/// Input to [`generate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOptions {
    /// Namespace in front of the slug; [`DEFAULT_NAMESPACE`] when unset.
    pub prefix: Option<String>,
    /// Human summary of the job.
    pub summary: Option<String>,
    /// Identifier of the job; the fallback slug source.
    pub job_id: String,
}

impl BranchOptions {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Build `<prefix>/<slug>` for a job.
pub fn generate(options: &BranchOptions) -> String {
    let prefix = options
        .prefix
        .as_deref()
        .map(|p| p.trim().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE);

    let slug = options
        .summary
        .as_deref()
        .map(summary_slug)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| job_id_slug(&options.job_id));

    format!("{prefix}/{slug}")
}

/// Slug from a summary; empty when nothing meaningful survives filtering.
pub fn summary_slug(summary: &str) -> String {
    let cleaned: String = summary
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();

    let words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .take(MAX_WORDS)
        .collect();

    let mut slug = words.join("-");
    // ASCII only at this point, so byte truncation is char-safe.
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

fn job_id_slug(job_id: &str) -> String {
    let slug: String = job_id
        .chars()
        .take(JOB_ID_PREFIX_LEN)
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "job".to_string()
    } else {
        slug.to_string()
    }
}
