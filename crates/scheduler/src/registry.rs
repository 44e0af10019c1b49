//! [`TaskRegistry`]: task records and coalesce-key ownership behind one lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dispatch_core::{Owner, TaskId};

use crate::handle::ExecutionHandle;
use crate::task::ScheduledTask;

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<TaskId, ScheduledTask>,
    /// coalesce key -> id of the task currently holding it
    coalesce: HashMap<String, TaskId>,
}

/// Shared task table.
///
/// The control context performs every mutation. Worker and loop threads only
/// read (through [`is_live`](TaskRegistry::is_live)) to decide whether a
/// completion is still worth posting. The lock is held for the map operation
/// only, never across an execution call.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // The maps stay consistent even if a holder panicked mid-read.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, task: ScheduledTask) {
        self.lock().tasks.insert(task.id, task);
    }

    pub fn get(&self, id: TaskId) -> Option<ScheduledTask> {
        self.lock().tasks.get(&id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<ScheduledTask> {
        self.lock().tasks.remove(&id)
    }

    /// Whether the task is registered and not cancelled.
    pub fn is_live(&self, id: TaskId) -> bool {
        self.lock().tasks.get(&id).is_some_and(|t| !t.cancelled)
    }

    /// Apply `f` to the stored record, if present.
    pub fn update<R>(&self, id: TaskId, f: impl FnOnce(&mut ScheduledTask) -> R) -> Option<R> {
        self.lock().tasks.get_mut(&id).map(f)
    }

    /// Record the handle of a fresh execution.
    pub fn set_handle(&self, id: TaskId, handle: ExecutionHandle) -> bool {
        self.update(id, |task| {
            task.handle = Some(handle);
            task.dispatch_count += 1;
        })
        .is_some()
    }

    /// Make `id` the holder of `key`, returning the previous holder.
    pub fn set_coalesce_holder(&self, key: &str, id: TaskId) -> Option<TaskId> {
        self.lock().coalesce.insert(key.to_string(), id)
    }

    pub fn get_coalesce_holder(&self, key: &str) -> Option<TaskId> {
        self.lock().coalesce.get(key).copied()
    }

    /// Drop the mapping for `key` only if `expected` still holds it.
    pub fn clear_coalesce_holder(&self, key: &str, expected: TaskId) -> bool {
        let mut state = self.lock();
        if state.coalesce.get(key) == Some(&expected) {
            state.coalesce.remove(key);
            true
        } else {
            false
        }
    }

    /// Install `id` as holder of `key` and, in the same critical section,
    /// cancel and detach the previous holder if it never began executing.
    ///
    /// Returns the id of the detached task, if any.
    pub fn supersede_holder(&self, key: &str, id: TaskId) -> Option<TaskId> {
        let mut state = self.lock();
        let previous = state.coalesce.insert(key.to_string(), id)?;
        if previous == id {
            return None;
        }
        let detach = match state.tasks.get_mut(&previous) {
            Some(prev) if !prev.cancelled && !prev.has_started() => {
                prev.cancelled = true;
                true
            }
            _ => false,
        };
        if detach {
            state.tasks.remove(&previous);
            Some(previous)
        } else {
            None
        }
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.lock().tasks.keys().copied().collect()
    }

    pub fn ids_for_owner(&self, owner: &Owner) -> Vec<TaskId> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.owner.as_ref() == Some(owner))
            .map(|t| t.id)
            .collect()
    }

    pub fn snapshot_all(&self) -> Vec<ScheduledTask> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Release every record and mapping.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.tasks.clear();
        state.coalesce.clear();
    }
}
