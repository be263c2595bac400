//! Synchronous git invocation with a working directory and a timeout.
//!
//! Every component in this crate talks to git through [`CommandRunner`], so
//! tests can substitute a scripted runner and exercise fallback chains
//! without a real repository. Commands are always built as argument
//! vectors; nothing is interpolated into a shell string.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors produced while invoking git.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started at all.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status.
    #[error("{command} failed (exit {}): {}", exit_code(.code), detail(.stderr, .stdout))]
    Exit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The process did not finish within its time budget and was killed.
    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}

impl CommandError {
    /// The full `git <args>` string of the failed command.
    pub fn command(&self) -> &str {
        match self {
            Self::Spawn { command, .. }
            | Self::Exit { command, .. }
            | Self::Timeout { command, .. } => command,
        }
    }

    /// Combined stdout and stderr of a failed command, for message sniffing.
    pub fn output(&self) -> String {
        match self {
            Self::Exit { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
            _ => String::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn detail(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

/// Runs the version-control tool.
pub trait CommandRunner: Send + Sync {
    /// Standard output exactly as the child wrote it.
    fn run_raw(&self, args: &[&str], cwd: &Path, timeout: Duration) -> Result<String, CommandError>;

    /// Standard output with trailing whitespace removed. Leading whitespace
    /// is kept because porcelain status lines start with a significant space.
    fn run(&self, args: &[&str], cwd: &Path, timeout: Duration) -> Result<String, CommandError> {
        self.run_raw(args, cwd, timeout)
            .map(|out| out.trim_end().to_string())
    }
}

/// [`CommandRunner`] backed by the `git` executable.
///
/// The child never sees a terminal: stdin is null, terminal credential
/// prompts are disabled and SSH runs in batch mode, so an operation that
/// needs credentials fails quickly instead of waiting out its timeout.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for GitCli {
    fn run_raw(&self, args: &[&str], cwd: &Path, timeout: Duration) -> Result<String, CommandError> {
        let command = format!("git {}", args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env(
                "GIT_SSH_COMMAND",
                "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child (large
        // diffs) cannot block on a full pipe while we poll for exit.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        tracing::debug!(%command, ?timeout, "git command timed out");
                        return Err(CommandError::Timeout { command, timeout });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(CommandError::Spawn { command, source });
                }
            }
        };

        let stdout = stdout_reader.map(join_reader).unwrap_or_default();
        let stderr = stderr_reader.map(join_reader).unwrap_or_default();

        if !status.success() {
            return Err(CommandError::Exit {
                command,
                code: status.code(),
                stdout,
                stderr,
            });
        }

        Ok(stdout)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
