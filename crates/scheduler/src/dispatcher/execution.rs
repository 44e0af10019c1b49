use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use dispatch_core::{ExecutionError, OverlapPolicy, TaskId};

use crate::async_loop::AsyncJob;
use crate::channel::CompletionEvent;
use crate::handle::ExecutionHandle;
use crate::pool::SyncJob;
use crate::task::{ScheduledTask, Work};
use crate::timers::{deadline_after, TimerKind};

use super::Dispatcher;

impl Dispatcher {
    /// Route a ready task to its executor.
    ///
    /// No-op for cancelled or unknown tasks. A task whose coalesce key has
    /// moved on to a newer task is retired instead of run: a debounce delay
    /// may have elapsed between that newer call's coalescing and now.
    pub(super) fn dispatch(&mut self, id: TaskId) {
        let task = match self.registry.get(id) {
            Some(task) if !task.cancelled => task,
            _ => return,
        };

        if let Some(key) = task.coalesce_key.as_deref() {
            if self.registry.get_coalesce_holder(key) != Some(id) {
                debug!(task_id = %id, key, "superseded before dispatch");
                self.metrics.superseded += 1;
                self.retire(id);
                return;
            }
        }

        if task.is_periodic() && self.config.periodic_overlap == OverlapPolicy::Skip {
            if let Some(previous) = &task.handle {
                if !previous.is_finished() {
                    debug!(task_id = %id, "previous execution still running, tick skipped");
                    self.metrics.skipped_ticks += 1;
                    return;
                }
            }
        }

        let handle = match &task.work {
            Work::Sync(_) => self.submit_sync(&task),
            Work::Async(_) => self.submit_async(&task),
        };

        if let Some(handle) = handle {
            self.registry.set_handle(id, handle);
            self.metrics.dispatched += 1;
            trace!(task_id = %id, mode = %task.mode(), "dispatched");
        }
    }

    fn submit_sync(&self, task: &ScheduledTask) -> Option<ExecutionHandle> {
        let (pool, func) = match (&self.pool, &task.work) {
            (Some(pool), Work::Sync(func)) => (pool, Arc::clone(func)),
            _ => return None,
        };
        Some(pool.submit(SyncJob {
            task_id: task.id,
            owner: task.owner.clone(),
            func,
            sink: self.results.sender(),
        }))
    }

    fn submit_async(&self, task: &ScheduledTask) -> Option<ExecutionHandle> {
        let factory = match &task.work {
            Work::Async(factory) => Arc::clone(factory),
            Work::Sync(_) => return None,
        };
        let Some(async_loop) = &self.async_loop else {
            self.reject(task, "async loop is not running".to_string());
            return None;
        };

        // The factory runs here, on the control context; a panic in it must
        // not unwind through the dispatcher.
        let future = match catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(future) => future,
            Err(payload) => {
                let err = ExecutionError::from_panic(payload);
                warn!(task_id = %task.id, error = %err, "async factory panicked");
                self.results.sender().post(CompletionEvent::new(
                    task.id,
                    task.owner.clone(),
                    Err(err),
                    Duration::ZERO,
                ));
                return None;
            }
        };

        let job = AsyncJob {
            task_id: task.id,
            owner: task.owner.clone(),
            future,
            sink: self.results.sender(),
        };
        match async_loop.submit(job) {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.reject(task, e.to_string());
                None
            }
        }
    }

    /// Deliver a rejection as the execution's single completion event.
    fn reject(&self, task: &ScheduledTask, reason: String) {
        warn!(task_id = %task.id, reason = %reason, "submission rejected");
        self.results.sender().post(CompletionEvent::new(
            task.id,
            task.owner.clone(),
            Err(ExecutionError::Rejected(reason)),
            Duration::ZERO,
        ));
    }

    /// Fire every timer whose deadline has passed.
    pub(super) fn fire_due_timers(&mut self) {
        for (id, kind) in self.timers.fire_due(Instant::now()) {
            match kind {
                TimerKind::Debounce => debug!(task_id = %id, "debounce elapsed"),
                TimerKind::Periodic { .. } => trace!(task_id = %id, "periodic tick"),
            }
            self.dispatch(id);
        }
    }

    /// Validate a received event against the registry.
    ///
    /// Events for removed or cancelled tasks are dropped. A delivered
    /// one-shot task is retired; periodic tasks stay registered.
    fn accept(&mut self, event: CompletionEvent) -> Option<CompletionEvent> {
        let task = match self.registry.get(event.task_id) {
            Some(task) if !task.cancelled => task,
            _ => {
                trace!(task_id = %event.task_id, "stale completion dropped");
                self.metrics.dropped_stale += 1;
                return None;
            }
        };

        self.metrics
            .record_completion(task.mode(), event.elapsed, event.is_success());

        if !task.is_periodic() {
            self.registry.remove(task.id);
            if let Some(key) = task.coalesce_key.as_deref() {
                self.registry.clear_coalesce_holder(key, task.id);
            }
        }
        Some(event)
    }

    /// Fire due timers and take every queued completion without blocking.
    pub fn drain(&mut self) -> Vec<CompletionEvent> {
        self.fire_due_timers();
        let mut events = Vec::new();
        while let Some(event) = self.results.try_recv() {
            if let Some(event) = self.accept(event) {
                events.push(event);
            }
        }
        events
    }

    /// Wait up to `timeout` for the next completion, firing timers as
    /// their deadlines pass.
    pub fn next_event(&mut self, timeout: Duration) -> Option<CompletionEvent> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            self.fire_due_timers();
            while let Some(event) = self.results.try_recv() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wake = match self.timers.next_deadline() {
                Some(at) if at < deadline => at,
                _ => deadline,
            };
            if let Some(event) = self.results.recv_timeout(wake.saturating_duration_since(now)) {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
            }
        }
    }

    /// Pump the control loop for `duration`, handing each completion to
    /// `on_event` together with the dispatcher so it can schedule follow-up
    /// work. Returns how many events were delivered.
    pub fn run_for<F>(&mut self, duration: Duration, mut on_event: F) -> usize
    where
        F: FnMut(&mut Dispatcher, CompletionEvent),
    {
        let deadline = deadline_after(Instant::now(), duration);
        let mut delivered = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if let Some(event) = self.next_event(remaining) {
                delivered += 1;
                on_event(self, event);
            }
        }
        delivered
    }

    /// Stop the scheduler. Idempotent and bounded: every outstanding task is
    /// cancelled, timers are dropped, the pool drains (when `wait`) and the
    /// loop thread is joined, each limited by the configured shutdown
    /// timeout. Threads that overrun it are abandoned.
    pub fn shutdown(&mut self, wait: bool) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!(wait, outstanding = self.registry.len(), "dispatcher shutting down");

        for id in self.registry.ids() {
            self.retire(id);
            self.metrics.cancelled += 1;
        }
        self.timers.clear();

        let timeout = self.config.shutdown_timeout();
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.shutdown(wait, timeout) {
                warn!(error = %e, "sync pool shutdown incomplete");
            }
        }
        if let Some(async_loop) = self.async_loop.take() {
            if let Err(e) = async_loop.stop(timeout) {
                warn!(error = %e, "async loop shutdown incomplete");
            }
        }

        self.registry.clear();
        let discarded = self.results.clear();
        if discarded > 0 {
            debug!(discarded, "discarded undelivered completions");
        }
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
