//! Completion events and the many-producer / one-consumer channel carrying
//! them back to the control context.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use dispatch_core::{ExecutionError, Owner, TaskId};

use crate::registry::TaskRegistry;

/// The single notification produced by one dispatched execution.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub owner: Option<Owner>,
    pub outcome: Result<serde_json::Value, ExecutionError>,
    /// Wall time spent inside the work item.
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn new(
        task_id: TaskId,
        owner: Option<Owner>,
        outcome: Result<serde_json::Value, ExecutionError>,
        elapsed: Duration,
    ) -> Self {
        Self {
            task_id,
            owner,
            outcome,
            elapsed,
            finished_at: Utc::now(),
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Producer half, cloned into every worker job and async wrapper.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<CompletionEvent>,
    registry: TaskRegistry,
}

impl CompletionSender {
    /// Post an event unless its task was cancelled or removed meanwhile.
    ///
    /// Returns whether the event was queued. The consumer re-checks on
    /// receipt, since a cancel can still land after this point.
    pub fn post(&self, event: CompletionEvent) -> bool {
        if !self.registry.is_live(event.task_id) {
            trace!(task_id = %event.task_id, "dropping completion for retired task");
            return false;
        }
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                trace!(task_id = %e.0.task_id, "result channel closed, completion discarded");
                false
            }
        }
    }
}

/// Consumer half, owned by the control context.
#[derive(Debug)]
pub struct ResultChannel {
    tx: Sender<CompletionEvent>,
    rx: Receiver<CompletionEvent>,
    registry: TaskRegistry,
}

impl ResultChannel {
    pub fn new(registry: TaskRegistry) -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx, registry }
    }

    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
            registry: self.registry.clone(),
        }
    }

    pub fn try_recv(&self) -> Option<CompletionEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<CompletionEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discard everything queued; returns how many events were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}
