//! Future-like handle returned by both executors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::AbortHandle;

use crate::task::ExecutionMode;

#[derive(Debug)]
struct HandleState {
    mode: ExecutionMode,
    started: AtomicBool,
    finished: AtomicBool,
    /// Guards both the cancel flag and the abort handle so that a cancel
    /// racing with the loop thread's spawn is never lost.
    control: Mutex<Control>,
}

#[derive(Debug, Default)]
struct Control {
    cancelled: bool,
    abort: Option<AbortHandle>,
}

/// Observation and best-effort cancellation of one dispatched execution.
///
/// Cheap to clone; all clones observe the same execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleState>,
}

impl ExecutionHandle {
    pub(crate) fn new(mode: ExecutionMode) -> Self {
        Self {
            inner: Arc::new(HandleState {
                mode,
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// True once the work returned, failed, or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire) || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.control().cancelled
    }

    /// Request cancellation. A queued sync item will not start; an async
    /// item is aborted at its next suspension point. A sync callable that is
    /// already running cannot be interrupted.
    ///
    /// Returns false if the execution had already finished.
    pub fn cancel(&self) -> bool {
        if self.inner.finished.load(Ordering::Acquire) {
            return false;
        }
        let mut control = self.control();
        if control.cancelled {
            return false;
        }
        control.cancelled = true;
        if let Some(abort) = control.abort.take() {
            abort.abort();
        }
        true
    }

    /// Mark the execution as running unless it was cancelled while queued.
    pub(crate) fn try_start(&self) -> bool {
        let control = self.control();
        if control.cancelled {
            return false;
        }
        self.inner.started.store(true, Ordering::Release);
        true
    }

    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    /// Run `spawn` on the loop thread and keep its abort handle, unless the
    /// handle was cancelled before the loop got to it.
    pub(crate) fn attach<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> AbortHandle,
    {
        let mut control = self.control();
        if control.cancelled {
            return false;
        }
        control.abort = Some(spawn());
        self.inner.started.store(true, Ordering::Release);
        true
    }

    fn control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.inner.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
