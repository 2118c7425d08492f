//! # External Process Execution
//!
//! Every FreeBSD tool the driver relies on (`jail`, `jls`, `rctl`, `jexec`) is
//! invoked through the [`ProcessRunner`] capability. Production code uses
//! [`SystemRunner`], which spawns real processes via `tokio::process`; tests
//! substitute a recording fake so lifecycle logic can be exercised on any
//! host.
//!
//! ## Two Invocation Styles
//!
//! | Method      | Waits for exit | Used by                            |
//! |-------------|----------------|------------------------------------|
//! | `output`    | yes, bounded   | `jail -r`, `jls`, `rctl`, `jexec`  |
//! | `launch`    | settle window  | `jail -c`                          |
//!
//! `jail -c` stays in the foreground for as long as a non-daemonizing
//! `exec.start` command runs. `launch` therefore only watches the process for
//! a short settle window: an early exit is reported with its output, a
//! process still running afterwards is detached and reaped in the background.
//!
//! ## Output Limits
//!
//! Captured stdout/stderr are truncated to [`MAX_OUTPUT_SIZE`] bytes.

use crate::constants::MAX_OUTPUT_SIZE;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Command Description
// =============================================================================

/// Program plus argument list of one external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Output of a process that exited with `code`.
    pub fn with_code(code: i32) -> Self {
        Self {
            status: Some(code),
            ..Self::default()
        }
    }

    /// Returns true if the process exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Converts a non-zero exit into [`Error::ExternalCommandFailed`].
    pub fn check(self, command: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let status = match self.status {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        Err(Error::ExternalCommandFailed {
            program: command.program.clone(),
            args: command.args.clone(),
            status,
            stdout: self.stdout_lossy(),
            stderr: self.stderr_lossy(),
        })
    }
}

/// Outcome of [`ProcessRunner::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// The process exited within the settle window.
    Exited(CommandOutput),
    /// The process was still running and now continues in the background.
    Detached,
}

// =============================================================================
// Runner Capability
// =============================================================================

/// Capability to run external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command` to completion, killing it after `timeout`.
    ///
    /// A non-zero exit is not an error here; callers use
    /// [`CommandOutput::check`] where failure matters.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the command outlives `timeout`
    /// - [`Error::ExternalCommandFailed`] if it cannot be spawned
    async fn output(&self, command: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;

    /// Starts `command` and watches it for at most `settle`.
    async fn launch(&self, command: &CommandSpec, settle: Duration) -> Result<Launch>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn spawn_failed(spec: &CommandSpec, err: std::io::Error) -> Error {
        Error::ExternalCommandFailed {
            program: spec.program.clone(),
            args: spec.args.clone(),
            status: format!("spawn failed: {}", err),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn output(&self, command: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        debug!("exec: {}", command);

        let mut cmd = Self::command(command);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: command.to_string(),
                duration: timeout,
            })?
            .map_err(|e| Self::spawn_failed(command, e))?;

        let mut result = CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if result.stdout.len() > MAX_OUTPUT_SIZE {
            result.stdout.truncate(MAX_OUTPUT_SIZE);
            warn!("{} stdout truncated to {} bytes", command.program, MAX_OUTPUT_SIZE);
        }
        if result.stderr.len() > MAX_OUTPUT_SIZE {
            result.stderr.truncate(MAX_OUTPUT_SIZE);
            warn!("{} stderr truncated to {} bytes", command.program, MAX_OUTPUT_SIZE);
        }

        Ok(result)
    }

    async fn launch(&self, command: &CommandSpec, settle: Duration) -> Result<Launch> {
        debug!("launch: {}", command);

        let mut child = Self::command(command)
            .spawn()
            .map_err(|e| Self::spawn_failed(command, e))?;

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        match tokio::time::timeout(settle, child.wait()).await {
            Ok(status) => {
                let status = status?;
                Ok(Launch::Exited(CommandOutput {
                    status: status.code(),
                    stdout: stdout.await.unwrap_or_default(),
                    stderr: stderr.await.unwrap_or_default(),
                }))
            }
            Err(_) => {
                let label = command.to_string();
                debug!("{} still running after {:?}, detaching", label, settle);
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => debug!("{} exited: {}", label, status),
                        Err(e) => warn!("failed to reap {}: {}", label, e),
                    }
                });
                Ok(Launch::Detached)
            }
        }
    }
}

/// Reads a pipe to EOF, keeping at most [`MAX_OUTPUT_SIZE`] bytes.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_OUTPUT_SIZE as u64);
    if limited.read_to_end(&mut buf).await.is_err() {
        return buf;
    }
    // Keep reading so the child never blocks on a full pipe.
    let mut rest = limited.into_inner();
    let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
    buf
}
