//! Typed wrapper around the FreeBSD jail tools.
//!
//! [`JailControl`] builds the argument lists of `jail`, `jls`, `rctl` and
//! `jexec` and runs them through a [`ProcessRunner`]. It holds no state
//! about jails; the kernel is the source of truth and is queried on demand.

use crate::config::{DriverConfig, ToolPaths};
use crate::constants::{
    JAIL_CREATE_FLAGS, JAIL_REMOVE_FLAG, JLS_NAME_VALUE_FLAG, MAX_JAIL_NAME_LEN, RCTL_ADD_FLAG,
};
use crate::error::{Error, Result};
use crate::params::JailParams;
use crate::process::{CommandSpec, Launch, ProcessRunner};
use crate::rctl::LimitRules;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of running a command inside a jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code; -1 if the command was killed by a signal.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs jail(8), jls(8), rctl(8) and jexec(8).
pub struct JailControl {
    runner: Arc<dyn ProcessRunner>,
    tools: ToolPaths,
    command_timeout: Duration,
    create_settle: Duration,
}

impl JailControl {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: &DriverConfig) -> Self {
        Self {
            runner,
            tools: config.tools.clone(),
            command_timeout: config.command_timeout(),
            create_settle: config.create_settle(),
        }
    }

    /// Creates the jail described by `params` with `jail -cmr`.
    ///
    /// Returns once `jail` has exited successfully, or once it has run for
    /// the settle period without failing (foreground `exec.start`).
    pub async fn create(&self, params: &JailParams) -> Result<()> {
        let cmd = CommandSpec::new(&self.tools.jail)
            .arg(JAIL_CREATE_FLAGS)
            .args(params.to_args());

        match self.runner.launch(&cmd, self.create_settle).await? {
            Launch::Exited(output) => {
                output.check(&cmd)?;
            }
            Launch::Detached => {
                debug!("jail creation still in foreground, continuing in background");
            }
        }

        info!("Created jail {}", params.value("name").unwrap_or_default());
        Ok(())
    }

    /// Removes a jail with `jail -r`, running its stop hooks.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let cmd = CommandSpec::new(&self.tools.jail)
            .arg(JAIL_REMOVE_FLAG)
            .arg(name);
        self.runner
            .output(&cmd, self.command_timeout)
            .await?
            .check(&cmd)?;
        info!("Removed jail {}", name);
        Ok(())
    }

    /// Returns true if `jls` lists a jail called `name`.
    ///
    /// # Errors
    ///
    /// A failed `jls` invocation is an error, not an absent jail.
    pub async fn is_active(&self, name: &str) -> Result<bool> {
        let cmd = CommandSpec::new(&self.tools.jls)
            .arg(JLS_NAME_VALUE_FLAG)
            .arg("name");
        let output = self
            .runner
            .output(&cmd, self.command_timeout)
            .await?
            .check(&cmd)?;
        Ok(jls_lists(&output.stdout_lossy(), name))
    }

    /// Applies resource limits with `rctl -a`.
    ///
    /// Each rule is appended to the argument list of the previous call, so
    /// the last invocation carries every rule. Re-adding a rule is a no-op
    /// for rctl.
    pub async fn apply_limits(&self, name: &str, rules: &LimitRules) -> Result<()> {
        let mut cmd = CommandSpec::new(&self.tools.rctl).arg(RCTL_ADD_FLAG);
        for limit in rules.iter() {
            cmd = cmd.arg(format!("jail:{}{}", name, limit));
            self.runner
                .output(&cmd, self.command_timeout)
                .await?
                .check(&cmd)?;
            debug!("rctl rule jail:{}{} applied", name, limit);
        }
        Ok(())
    }

    /// Runs `command` inside the jail with `jexec`.
    ///
    /// A non-zero exit is reported in the result, not as an error.
    pub async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecResult> {
        if command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        let cmd = CommandSpec::new(&self.tools.jexec)
            .arg(name)
            .args(command.iter().cloned());
        let output = self.runner.output(&cmd, timeout).await?;
        Ok(ExecResult {
            exit_code: output.status.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Returns true if `jls -n name` output contains `name=<name>`.
fn jls_lists(stdout: &str, name: &str) -> bool {
    stdout
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("name="))
        .any(|listed| listed == name)
}

/// Checks that `name` can be passed to jail(8) as a plain jail name.
pub fn validate_jail_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidJailName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_JAIL_NAME_LEN {
        return Err(invalid("name too long"));
    }
    // '.' separates hierarchical jail names.
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '.' | '=' | '/'))
    {
        return Err(invalid(&format!("character {:?} not allowed", c)));
    }
    Ok(())
}
