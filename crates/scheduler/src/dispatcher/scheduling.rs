use std::time::{Duration, Instant};

use tracing::debug;

use dispatch_core::{Owner, SchedulerError, TaskId};

use crate::task::{ScheduledTask, TaskOptions, Work};

use super::Dispatcher;

/// Debounce and periodic intervals must be strictly positive.
/// Intervals must be positive and small enough that a deadline one interval
/// from now is still representable.
fn validate_interval(field: &'static str, interval: Duration) -> Result<(), SchedulerError> {
    if interval.is_zero() || Instant::now().checked_add(interval).is_none() {
        return Err(SchedulerError::InvalidInterval { field });
    }
    Ok(())
}

impl Dispatcher {
    /// Schedule a single execution of `work`.
    ///
    /// With a coalesce key, a previous holder of the key that has not begun
    /// executing is cancelled. With a debounce interval, dispatch waits for
    /// the interval to elapse; otherwise it happens immediately.
    pub fn schedule_once(&mut self, work: Work, options: TaskOptions) -> Result<TaskId, SchedulerError> {
        self.ensure_accepting(&work)?;
        if let Some(delay) = options.debounce {
            validate_interval("debounce", delay)?;
        }

        let task = ScheduledTask::once(work, options);
        let id = task.id;
        let coalesce_key = task.coalesce_key.clone();
        let debounce = task.debounce;
        self.registry.register(task);
        self.metrics.scheduled += 1;

        if let Some(key) = coalesce_key.as_deref() {
            self.claim_coalesce_key(key, id);
        }

        match debounce {
            Some(delay) => {
                self.timers.arm_debounce(id, delay, Instant::now());
                debug!(task_id = %id, ?delay, "debounce armed");
            }
            None => self.dispatch(id),
        }
        Ok(id)
    }

    /// Schedule `work` to run every `interval` until cancelled. The first
    /// execution happens one interval from now.
    ///
    /// Every tick dispatches independently; whether a tick waits for a slow
    /// previous execution is governed by the configured overlap policy.
    pub fn schedule_periodic(
        &mut self,
        work: Work,
        interval: Duration,
        options: TaskOptions,
    ) -> Result<TaskId, SchedulerError> {
        self.ensure_accepting(&work)?;
        validate_interval("periodic", interval)?;
        if options.debounce.is_some() {
            debug!("debounce is not applied to periodic tasks");
        }

        let task = ScheduledTask::periodic(work, interval, options);
        let id = task.id;
        let coalesce_key = task.coalesce_key.clone();
        self.registry.register(task);
        self.metrics.scheduled += 1;

        if let Some(key) = coalesce_key.as_deref() {
            self.claim_coalesce_key(key, id);
        }

        self.timers.arm_periodic(id, interval, Instant::now());
        debug!(task_id = %id, ?interval, "periodic task armed");
        Ok(id)
    }

    /// Cancel a task. Unknown or already-cancelled ids are ignored, so
    /// repeated calls are harmless. Returns whether anything was cancelled.
    ///
    /// A sync callable already running on a worker is not interrupted; its
    /// late result is dropped instead.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if self.registry.get(id).is_none() {
            debug!(task_id = %id, "cancel ignored, task not found");
            return false;
        }
        self.retire(id);
        self.metrics.cancelled += 1;
        debug!(task_id = %id, "task cancelled");
        true
    }

    /// Cancel every task carrying `owner`. Returns how many were cancelled.
    pub fn cancel_owner(&mut self, owner: &Owner) -> usize {
        let ids = self.registry.ids_for_owner(owner);
        let cancelled = ids.into_iter().filter(|&id| self.cancel(id)).count();
        debug!(owner = %owner, cancelled, "owner tasks cancelled");
        cancelled
    }

    fn ensure_accepting(&self, work: &Work) -> Result<(), SchedulerError> {
        if self.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        if matches!(work, Work::Async(_)) && self.async_loop.is_none() {
            return Err(SchedulerError::NotConfigured(
                "async work needs the async loop (set async_loop = true)".to_string(),
            ));
        }
        Ok(())
    }

    fn claim_coalesce_key(&mut self, key: &str, id: TaskId) {
        if let Some(previous) = self.registry.supersede_holder(key, id) {
            self.timers.disarm(previous);
            self.metrics.coalesced += 1;
            debug!(task_id = %previous, superseded_by = %id, key, "pending task coalesced");
        }
    }

    /// Remove a task everywhere: mark it cancelled, stop its timer, cancel
    /// its live execution, and release its coalesce key.
    pub(super) fn retire(&mut self, id: TaskId) {
        self.timers.disarm(id);
        let Some(mut task) = self.registry.remove(id) else {
            return;
        };
        task.cancelled = true;
        if let Some(handle) = &task.handle {
            handle.cancel();
        }
        if let Some(key) = task.coalesce_key.as_deref() {
            self.registry.clear_coalesce_holder(key, id);
        }
    }
}
