//! Per-task handle and lifecycle state.

use crate::error::{Error, Result};
use crate::spec::TaskConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a task.
///
/// ```text
/// Starting ──► Running ──► Exited
/// ```
///
/// `Starting` is never visible through the driver; a handle is registered
/// only after its jail exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Starting,
    Running,
    Exited,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// How a task ended.
///
/// Jails have no exit status of their own; a jail that disappears is
/// reported as a clean exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub exit_code: i32,
    pub signal: i32,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub container_name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_result: Option<ExitResult>,
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

/// Driver-side record of one task.
///
/// Mutable fields sit behind a single lock; every state change is also
/// published on a watch channel for [`wait_task`](super::JailDriver::wait_task).
#[derive(Debug)]
pub struct TaskHandle {
    config: TaskConfig,
    container_name: String,
    lifecycle: RwLock<Lifecycle>,
    state_tx: watch::Sender<TaskState>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Creates a handle in `Starting`.
    pub fn new(config: TaskConfig, container_name: String, cancel: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Starting);
        Self {
            config,
            container_name,
            lifecycle: RwLock::new(Lifecycle {
                state: TaskState::Starting,
                started_at: DateTime::<Utc>::MIN_UTC,
                completed_at: None,
                exit_result: None,
            }),
            state_tx,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Current state, as last published.
    pub fn state(&self) -> TaskState {
        *self.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Receiver observing state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    /// Token cancelled when the task is destroyed or the driver shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Snapshot of the handle.
    pub fn status(&self) -> Result<TaskStatus> {
        let lifecycle = self.read()?;
        Ok(TaskStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            container_name: self.container_name.clone(),
            state: lifecycle.state,
            started_at: lifecycle.started_at,
            completed_at: lifecycle.completed_at,
            exit_result: lifecycle.exit_result,
        })
    }

    pub fn exit_result(&self) -> Result<Option<ExitResult>> {
        Ok(self.read()?.exit_result)
    }

    /// `Starting → Running`.
    pub(crate) fn mark_running(&self, started_at: DateTime<Utc>) -> Result<()> {
        let mut lifecycle = self.write()?;
        if lifecycle.state != TaskState::Starting {
            return Err(Error::Internal(format!(
                "task {} cannot start from state {}",
                self.config.id, lifecycle.state
            )));
        }
        lifecycle.state = TaskState::Running;
        lifecycle.started_at = started_at;
        self.state_tx.send_replace(TaskState::Running);
        Ok(())
    }

    /// `Running → Exited`. Returns false if the task had already exited.
    pub(crate) fn mark_exited(&self, completed_at: DateTime<Utc>, result: ExitResult) -> Result<bool> {
        let mut lifecycle = self.write()?;
        if lifecycle.state == TaskState::Exited {
            return Ok(false);
        }
        lifecycle.state = TaskState::Exited;
        lifecycle.completed_at = Some(completed_at);
        lifecycle.exit_result = Some(result);
        self.state_tx.send_replace(TaskState::Exited);
        Ok(true)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Lifecycle>> {
        self.lifecycle
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Lifecycle>> {
        self.lifecycle
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn handle() -> TaskHandle {
        let config = TaskConfig {
            id: "t1".to_string(),
            name: "web".to_string(),
            alloc_id: "abc".to_string(),
            alloc_dir: Default::default(),
            driver_config: serde_json::Value::Null,
        };
        TaskHandle::new(config, "web-abc".to_string(), CancellationToken::new())
    }

    #[test]
    fn test_lifecycle_transitions() {
        let h = handle();
        assert_eq!(h.state(), TaskState::Starting);

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        h.mark_running(start).unwrap();
        assert!(h.is_running());
        assert_eq!(h.status().unwrap().started_at, start);

        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        assert!(h.mark_exited(end, ExitResult::default()).unwrap());
        let status = h.status().unwrap();
        assert_eq!(status.state, TaskState::Exited);
        assert_eq!(status.completed_at, Some(end));
        assert_eq!(status.exit_result, Some(ExitResult::default()));
    }

    #[test]
    fn test_exit_is_terminal() {
        let h = handle();
        h.mark_running(Utc::now()).unwrap();
        assert!(h.mark_exited(Utc::now(), ExitResult::default()).unwrap());
        assert!(!h.mark_exited(Utc::now(), ExitResult { exit_code: 1, signal: 0 }).unwrap());
        assert_eq!(h.exit_result().unwrap(), Some(ExitResult::default()));
        assert!(h.mark_running(Utc::now()).is_err());
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let h = handle();
        let rx = h.subscribe();
        h.mark_running(Utc::now()).unwrap();
        assert_eq!(*rx.borrow(), TaskState::Running);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::Running.to_string(), "running");
        assert_eq!(TaskState::Exited.to_string(), "exited");
    }
}
