//! Ordered fallback chains.
//!
//! Several operations try a sequence of alternatives ("checkout main, else
//! master, else stay put"; "worktree remove, else prune, else delete the
//! directory"). Each chain is an explicit list of tagged steps evaluated in
//! order; the first success wins and its tag is returned so callers can
//! log and assert which path was taken.

use std::fmt;

/// A sequence of tagged fallible steps.
pub struct FallbackChain<'a, K, T, E> {
    what: &'static str,
    steps: Vec<(K, Box<dyn FnOnce() -> Result<T, E> + 'a>)>,
}

/// Every step of a chain failed. Failures are kept in step order.
#[derive(Debug)]
pub struct FallbackExhausted<K, E> {
    pub what: &'static str,
    pub failures: Vec<(K, E)>,
}

impl<K, E> FallbackExhausted<K, E> {
    /// Error of the final step, usually the most relevant one.
    pub fn into_last(self) -> Option<E> {
        self.failures.into_iter().last().map(|(_, e)| e)
    }
}

impl<K: fmt::Debug, E: fmt::Display> fmt::Display for FallbackExhausted<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every fallback failed for {}", self.what)?;
        for (tag, err) in &self.failures {
            write!(f, "; {tag:?}: {err}")?;
        }
        Ok(())
    }
}

impl<'a, K, T, E> FallbackChain<'a, K, T, E>
where
    K: Copy + fmt::Debug,
    E: fmt::Display,
{
    /// Start an empty chain; `what` names the operation in logs.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn then(mut self, tag: K, action: impl FnOnce() -> Result<T, E> + 'a) -> Self {
        self.steps.push((tag, Box::new(action)));
        self
    }

    /// Run steps in order until one succeeds.
    pub fn run(self) -> Result<(K, T), FallbackExhausted<K, E>> {
        let mut failures = Vec::new();
        for (tag, action) in self.steps {
            match action() {
                Ok(value) => {
                    if !failures.is_empty() {
                        tracing::info!(chain = self.what, step = ?tag, "fallback step succeeded");
                    }
                    return Ok((tag, value));
                }
                Err(e) => {
                    tracing::warn!(chain = self.what, step = ?tag, error = %e, "fallback step failed");
                    failures.push((tag, e));
                }
            }
        }
        Err(FallbackExhausted {
            what: self.what,
            failures,
        })
    }
}
