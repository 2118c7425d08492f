//! Task registry keyed by task id.
//!
//! A start first reserves its id, so two concurrent starts of the same task
//! cannot both proceed; the reservation is released if the start fails and
//! replaced by the handle if it succeeds. Reserved ids are invisible to
//! lookups.

use super::handle::TaskHandle;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

enum Slot {
    Reserved,
    Ready(Arc<TaskHandle>),
}

#[derive(Default)]
pub(crate) struct TaskStore {
    tasks: RwLock<HashMap<String, Slot>>,
}

impl TaskStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &str) -> Result<Option<Arc<TaskHandle>>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(match tasks.get(id) {
            Some(Slot::Ready(handle)) => Some(Arc::clone(handle)),
            _ => None,
        })
    }

    /// Reserves `id`, failing with [`Error::AlreadyStarted`] if it is taken.
    pub(crate) fn reserve(&self, id: &str) -> Result<Reservation<'_>> {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        if tasks.contains_key(id) {
            return Err(Error::AlreadyStarted(id.to_string()));
        }
        tasks.insert(id.to_string(), Slot::Reserved);
        Ok(Reservation {
            store: self,
            id: id.to_string(),
            committed: false,
        })
    }

    pub(crate) fn remove(&self, id: &str) -> Result<Option<Arc<TaskHandle>>> {
        let mut tasks = self
            .tasks
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(match tasks.remove(id) {
            Some(Slot::Ready(handle)) => Some(handle),
            Some(Slot::Reserved) => {
                // Not ours to release.
                tasks.insert(id.to_string(), Slot::Reserved);
                None
            }
            None => None,
        })
    }

    pub(crate) fn handles(&self) -> Result<Vec<Arc<TaskHandle>>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        Ok(tasks
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(handle) => Some(Arc::clone(handle)),
                Slot::Reserved => None,
            })
            .collect())
    }
}

/// Claim on a task id, released on drop unless committed.
pub(crate) struct Reservation<'a> {
    store: &'a TaskStore,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    /// Publishes `handle` under the reserved id.
    pub(crate) fn commit(mut self, handle: Arc<TaskHandle>) -> Result<()> {
        let mut tasks = self
            .store
            .tasks
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        tasks.insert(self.id.clone(), Slot::Ready(handle));
        self.committed = true;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Ok(mut tasks) = self.store.tasks.write()
            && matches!(tasks.get(&self.id), Some(Slot::Reserved))
        {
            tasks.remove(&self.id);
        }
    }
}
