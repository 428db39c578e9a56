//! Process execution behind a narrow, mockable interface.
//!
//! Every container, git, test and type-check invocation goes through a
//! [`CommandRunner`], so the container engine and VCS specifics can be
//! swapped out or scripted in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// How long to keep draining pipes after the process has exited or been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Options for a single command invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Maximum wall-clock time. Falls back to the runner's default.
    pub timeout: Option<Duration>,
    /// Working directory on the host.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl RunOptions {
    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished (or timed out) command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether the command was killed for exceeding its timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Creates a successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Creates a failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Returns stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// Converts a timeout or non-zero exit into an error.
    pub fn into_checked(self, command: &str, timeout: Duration) -> Result<Self> {
        if self.timed_out {
            return Err(Error::CommandTimeout {
                command: command.to_string(),
                timeout,
                partial_output: self.combined(),
            });
        }
        if self.exit_code != Some(0) {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: if self.stderr.trim().is_empty() {
                    self.stdout.trim().to_string()
                } else {
                    self.stderr.trim().to_string()
                },
            });
        }
        Ok(self)
    }
}

/// Renders a program and its arguments for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push_str(&format!("{:?}", arg));
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Runs external programs.
///
/// Implementations must not fail for a non-zero exit code; callers interpret
/// [`CommandOutput::exit_code`]. An `Err` means the program could not be
/// started at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and waits for it, bounded by the timeout.
    async fn run(&self, program: &str, args: &[String], options: &RunOptions)
        -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    default_timeout: Duration,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl ShellRunner {
    /// Creates a runner with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn spawn_drain<R>(reader: Option<R>) -> (SharedBuffer, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
    let Some(mut reader) = reader else {
        return (buffer, None);
    };
    let sink = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buffer, Some(handle))
}

async fn collect(buffer: SharedBuffer, handle: Option<JoinHandle<()>>) -> String {
    if let Some(handle) = handle {
        // A grandchild can keep the pipe open after the child is gone.
        let abort = handle.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
            abort.abort();
        }
    }
    let bytes = buffer.lock().map(|b| b.clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        options: &RunOptions,
    ) -> Result<CommandOutput> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        tracing::debug!(command = %display_command(program, args), ?timeout, "running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &options.env {
            command.env(key, value);
        }

        let start = Instant::now();
        let mut child = command.spawn()?;
        let (stdout_buf, stdout_task) = spawn_drain(child.stdout.take());
        let (stderr_buf, stderr_task) = spawn_drain(child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                tracing::warn!(
                    command = %display_command(program, args),
                    ?timeout,
                    "command timed out, killing"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                (None, true)
            }
        };

        let stdout = collect(stdout_buf, stdout_task).await;
        let stderr = collect(stderr_buf, stderr_task).await;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration: start.elapsed(),
            timed_out,
        })
    }
}
