//! # Jail Task Driver
//!
//! [`JailDriver`] runs scheduler tasks as FreeBSD jails. It owns the task
//! registry and drives each task through its lifecycle:
//!
//! ```text
//!             start_task                      jail disappears
//!   (none) ─────────────► Running ───────────────────────────► Exited
//!     ▲                      │                                   │
//!     │   destroy_task       │ destroy_task(force)               │
//!     └──────────────────────┴───────────────────────────────────┘
//! ```
//!
//! ## Starting a Task
//!
//! 1. Reserve the task id ([`Error::AlreadyStarted`] if taken)
//! 2. Decode the driver config and check it has a start command
//! 3. Compile resource limits
//! 4. Pull the image into the jail path, if one is configured
//! 5. Translate the config into jail parameters and run `jail -cmr`
//! 6. Apply limits with `rctl -a`; on failure the jail is removed again
//! 7. Register the handle as Running and start its monitor
//!
//! ## Recovery
//!
//! [`JailDriver::recover_task`] takes the [`DriverState`] returned by
//! [`JailDriver::start_task`]. A jail still listed by `jls` is re-attached;
//! a missing one is provisioned again from the persisted config.
//!
//! ## Concurrency
//!
//! The registry lock is only held for lookups and inserts, never across an
//! `.await`. Each handle guards its own fields.

mod handle;
mod store;

pub use handle::{ExitResult, TaskHandle, TaskState, TaskStatus};

use crate::config::DriverConfig;
use crate::constants::TASK_HANDLE_VERSION;
use crate::error::{Error, Result};
use crate::image::{ImagePuller, PullOptions};
use crate::jail::{ExecResult, JailControl, validate_jail_name};
use crate::monitor::{Clock, ContainerMonitor, IntervalTicker, SystemClock, TickerFactory};
use crate::params;
use crate::process::{ProcessRunner, SystemRunner};
use crate::rctl;
use crate::registry::{HttpRegistry, ImageReference, RegistryTransport};
use crate::spec::{JailConfig, TaskConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use store::TaskStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Persisted State and Capabilities
// =============================================================================

/// Record persisted by the scheduler to recover a task after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    /// [`TASK_HANDLE_VERSION`] of the writer.
    pub version: u32,
    pub task_config: TaskConfig,
    pub container_name: String,
    pub started_at: DateTime<Utc>,
}

impl DriverState {
    pub fn new(task_config: TaskConfig, container_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            version: TASK_HANDLE_VERSION,
            task_config,
            container_name,
            started_at,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("encode driver state: {}", e)))
    }

    /// Decodes a persisted record, rejecting versions this driver does not write.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let state: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::decode("driver state", e))?;
        if state.version != TASK_HANDLE_VERSION {
            return Err(Error::decode(
                "driver state",
                format!(
                    "unsupported version {} (expected {})",
                    state.version, TASK_HANDLE_VERSION
                ),
            ));
        }
        Ok(state)
    }
}

/// Filesystem isolation offered to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsIsolation {
    None,
    Chroot,
    Image,
}

/// Features the driver reports to its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub send_signals: bool,
    pub exec: bool,
    pub fs_isolation: FsIsolation,
}

// =============================================================================
// Driver
// =============================================================================

/// Runs tasks as jails.
pub struct JailDriver {
    config: DriverConfig,
    jail: Arc<JailControl>,
    images: ImagePuller,
    tasks: TaskStore,
    clock: Arc<dyn Clock>,
    tickers: TickerFactory,
    shutdown: CancellationToken,
}

impl JailDriver {
    /// Creates a driver using `runner` for the jail tools and `registry` for
    /// image pulls.
    pub fn new(
        config: DriverConfig,
        runner: Arc<dyn ProcessRunner>,
        registry: Arc<dyn RegistryTransport>,
    ) -> Self {
        let jail = Arc::new(JailControl::new(runner, &config));
        let images = ImagePuller::new(registry, config.scratch_dir.clone());
        let tickers = IntervalTicker::factory(config.monitor_interval());
        Self {
            config,
            jail,
            images,
            tasks: TaskStore::new(),
            clock: Arc::new(SystemClock),
            tickers,
            shutdown: CancellationToken::new(),
        }
    }

    /// Driver backed by real processes and the HTTP registry transport.
    pub fn from_config(config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let registry = HttpRegistry::new(config.registry.clone())?;
        Ok(Self::new(config, Arc::new(SystemRunner), Arc::new(registry)))
    }

    /// Replaces the clock used for task timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the ticker factory used by monitors.
    pub fn with_ticker_factory(mut self, tickers: TickerFactory) -> Self {
        self.tickers = tickers;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            send_signals: false,
            exec: true,
            fs_isolation: FsIsolation::Image,
        }
    }

    /// Starts a task and returns the state to persist for recovery.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the id is registered; the existing
    ///   handle is left untouched
    /// - [`Error::Decode`] for a malformed driver config
    /// - [`Error::MissingStartCommand`] before any external tool runs
    /// - image pipeline, `jail` and `rctl` failures
    pub async fn start_task(&self, task: TaskConfig) -> Result<DriverState> {
        let reservation = self.tasks.reserve(&task.id)?;

        let name = task.container_name();
        validate_jail_name(&name)?;
        let config = task.decode_driver_config()?;
        params::check_start_command(&name, &config, config.has_image())?;

        info!(task_id = %task.id, jail = %name, "Starting task");
        let handle = Arc::new(TaskHandle::new(
            task.clone(),
            name.clone(),
            self.shutdown.child_token(),
        ));

        self.provision(&task, &name, &config).await?;

        let started_at = self.clock.now();
        handle.mark_running(started_at)?;
        reservation.commit(Arc::clone(&handle))?;
        self.spawn_monitor(handle);

        info!(task_id = %task.id, jail = %name, "Task running");
        Ok(DriverState::new(task, name, started_at))
    }

    /// Re-registers a task from persisted state. No-op if it is registered.
    pub async fn recover_task(&self, state: DriverState) -> Result<()> {
        let id = state.task_config.id.clone();
        if self.tasks.get(&id)?.is_some() {
            debug!("task {} already registered, nothing to recover", id);
            return Ok(());
        }
        let reservation = match self.tasks.reserve(&id) {
            Ok(reservation) => reservation,
            Err(Error::AlreadyStarted(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let name = state.container_name.clone();
        let handle = Arc::new(TaskHandle::new(
            state.task_config.clone(),
            name.clone(),
            self.shutdown.child_token(),
        ));

        if self.jail.is_active(&name).await? {
            info!(task_id = %id, jail = %name, "Re-attached to running jail");
        } else {
            let config = state.task_config.decode_driver_config()?;
            params::check_start_command(&name, &config, config.has_image())?;
            self.provision(&state.task_config, &name, &config).await?;
            info!(task_id = %id, jail = %name, "Re-created missing jail");
        }

        handle.mark_running(state.started_at)?;
        reservation.commit(Arc::clone(&handle))?;
        self.spawn_monitor(handle);
        Ok(())
    }

    /// Waits `timeout`, then removes the jail with `jail -r`.
    ///
    /// The delay gives the task's own shutdown a head start; `jail -r` runs
    /// the `exec.stop` hooks. A task that already exited is left alone.
    pub async fn stop_task(&self, id: &str, timeout: Duration) -> Result<()> {
        let handle = self.lookup(id)?;
        if !handle.is_running() {
            debug!("task {} already exited, nothing to stop", id);
            return Ok(());
        }

        info!(task_id = %id, jail = %handle.container_name(), "Stopping task in {:?}", timeout);
        tokio::time::sleep(timeout).await;

        if let Err(e) = self.jail.remove(handle.container_name()).await {
            warn!(task_id = %id, "failed to remove jail {}: {}", handle.container_name(), e);
            return Err(e);
        }
        Ok(())
    }

    /// Unregisters a task, stopping it first when `force` is set.
    pub async fn destroy_task(&self, id: &str, force: bool) -> Result<()> {
        let handle = self.lookup(id)?;

        if handle.is_running() {
            if !force {
                return Err(Error::TaskStillRunning(id.to_string()));
            }
            if let Err(e) = self.stop_task(id, self.config.destroy_grace()).await {
                warn!(task_id = %id, "forced stop failed: {}", e);
            }
        }

        handle.cancel_token().cancel();
        self.tasks.remove(id)?;
        info!(task_id = %id, "Task destroyed");
        Ok(())
    }

    /// Snapshot of a task.
    pub fn inspect_task(&self, id: &str) -> Result<TaskStatus> {
        self.lookup(id)?.status()
    }

    /// Snapshots of every registered task.
    pub fn list_tasks(&self) -> Result<Vec<TaskStatus>> {
        self.tasks.handles()?.iter().map(|h| h.status()).collect()
    }

    /// Resolves once the task has exited.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if `cancel` fires, or if the task is destroyed
    /// or the driver shuts down before the task exits.
    pub async fn wait_task(&self, id: &str, cancel: &CancellationToken) -> Result<ExitResult> {
        let handle = self.lookup(id)?;
        let mut states = handle.subscribe();

        let exited = tokio::select! {
            biased;
            changed = states.wait_for(|state| *state == TaskState::Exited) => changed.is_ok(),
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("wait for task {}", id)));
            }
            _ = handle.cancel_token().cancelled() => false,
        };
        if !exited {
            return Err(Error::Cancelled(format!(
                "task {} is no longer monitored",
                id
            )));
        }

        handle
            .exit_result()?
            .ok_or_else(|| Error::Internal(format!("task {} exited without a result", id)))
    }

    /// Runs a command inside the task's jail.
    pub async fn exec_task(
        &self,
        id: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecResult> {
        if command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        let handle = self.lookup(id)?;
        debug!(task_id = %id, "exec {:?}", command);
        self.jail
            .exec(handle.container_name(), command, timeout)
            .await
    }

    /// Jails cannot be signalled as a unit.
    pub fn signal_task(&self, id: &str, signal: &str) -> Result<()> {
        Err(Error::NotSupported(format!(
            "signal {} for task {}: jails cannot be signalled",
            signal, id
        )))
    }

    /// Resource usage is not collected.
    pub fn task_stats(&self, id: &str) -> Result<()> {
        Err(Error::NotSupported(format!("stats for task {}", id)))
    }

    /// Stops every monitor and releases pending waiters.
    pub fn shutdown(&self) {
        info!("Shutting down jail driver");
        self.shutdown.cancel();
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lookup(&self, id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks
            .get(id)?
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Pulls the image, creates the jail and applies its limits.
    async fn provision(&self, task: &TaskConfig, name: &str, config: &JailConfig) -> Result<()> {
        let limits = rctl::compile_limits(&config.rctl)?;

        let hooks = if config.has_image() {
            let reference = ImageReference::parse(&config.image)?;
            let path = params::jail_path(task, config);
            let options = PullOptions {
                repackage: self.config.repackage_images,
            };
            let image = self
                .images
                .pull(&reference, &path, options, &self.shutdown)
                .await?;
            Some(image.hooks)
        } else {
            None
        };

        let jail_params = params::translate(task, config, hooks.as_ref())?;
        debug!(jail = %name, "jail parameters: {}", jail_params);
        self.jail.create(&jail_params).await?;

        if let Err(e) = self.jail.apply_limits(name, &limits).await {
            warn!(jail = %name, "applying limits failed, removing jail: {}", e);
            if let Err(rollback) = self.jail.remove(name).await {
                warn!(jail = %name, "rollback failed: {}", rollback);
            }
            return Err(e);
        }

        Ok(())
    }

    fn spawn_monitor(&self, handle: Arc<TaskHandle>) {
        let monitor = ContainerMonitor::new(
            handle,
            Arc::clone(&self.jail),
            (self.tickers)(),
            Arc::clone(&self.clock),
        );
        monitor.spawn();
    }
}
