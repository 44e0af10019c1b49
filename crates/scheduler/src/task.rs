use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;

use dispatch_core::{Owner, TaskId};

use crate::handle::ExecutionHandle;

/// Value produced by a unit of work.
pub type TaskOutput = anyhow::Result<serde_json::Value>;

/// Synchronous callable with its arguments already bound.
pub type SyncFn = Arc<dyn Fn() -> TaskOutput + Send + Sync>;

/// Zero-argument factory producing a fresh future per execution.
pub type AsyncFactory = Arc<dyn Fn() -> BoxFuture<'static, TaskOutput> + Send + Sync>;

/// Which executor runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "sync"),
            ExecutionMode::Async => write!(f, "async"),
        }
    }
}

/// A work descriptor. Periodic tasks call it once per tick, so both variants
/// are `Fn`, not `FnOnce`.
#[derive(Clone)]
pub enum Work {
    Sync(SyncFn),
    Async(AsyncFactory),
}

impl Work {
    /// Wrap a blocking callable for the sync worker pool.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> TaskOutput + Send + Sync + 'static,
    {
        Work::Sync(Arc::new(f))
    }

    /// Wrap a future factory for the async loop.
    pub fn future<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Work::Async(Arc::new(move || factory().boxed()))
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Work::Sync(_) => ExecutionMode::Sync,
            Work::Async(_) => ExecutionMode::Async,
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Work::{:?}", self.mode())
    }
}

/// Optional scheduling parameters shared by one-shot and periodic calls.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub owner: Option<Owner>,
    pub coalesce_key: Option<String>,
    pub debounce: Option<Duration>,
    /// Reserved; carried on the record but not consulted by any algorithm.
    pub priority: i32,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<Owner>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn coalesce(mut self, key: impl Into<String>) -> Self {
        self.coalesce_key = Some(key.into());
        self
    }

    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }

    pub fn debounce_ms(self, ms: u64) -> Self {
        self.debounce(Duration::from_millis(ms))
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Registry record for one scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub work: Work,
    pub owner: Option<Owner>,
    pub coalesce_key: Option<String>,
    pub debounce: Option<Duration>,
    pub periodic: Option<Duration>,
    pub cancelled: bool,
    /// Handle of the most recent execution; `None` until first dispatch.
    pub handle: Option<ExecutionHandle>,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub dispatch_count: u64,
}

impl ScheduledTask {
    pub fn once(work: Work, options: TaskOptions) -> Self {
        Self {
            id: TaskId::new(),
            work,
            owner: options.owner,
            coalesce_key: options.coalesce_key,
            debounce: options.debounce,
            periodic: None,
            cancelled: false,
            handle: None,
            scheduled_at: Utc::now(),
            priority: options.priority,
            dispatch_count: 0,
        }
    }

    pub fn periodic(work: Work, interval: Duration, options: TaskOptions) -> Self {
        Self {
            periodic: Some(interval),
            debounce: None,
            ..Self::once(work, options)
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.work.mode()
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic.is_some()
    }

    /// Whether execution has begun at least once. Coalescing only cancels
    /// tasks for which this is still false.
    pub fn has_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn state(&self) -> TaskState {
        if self.cancelled {
            return TaskState::Cancelled;
        }
        match &self.handle {
            None => TaskState::Pending,
            Some(h) if h.is_finished() => TaskState::Idle,
            Some(_) => TaskState::Running,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            mode: self.mode(),
            owner: self.owner.as_ref().map(|o| o.to_string()),
            coalesce_key: self.coalesce_key.clone(),
            debounce_ms: self.debounce.map(millis),
            periodic_ms: self.periodic.map(millis),
            state: self.state(),
            scheduled_at: self.scheduled_at,
            priority: self.priority,
            dispatch_count: self.dispatch_count,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Coarse lifecycle position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Registered, waiting for debounce or first tick.
    Pending,
    /// An execution is queued or running.
    Running,
    /// Last execution finished; periodic tasks wait here between ticks.
    Idle,
    Cancelled,
}

/// Serializable view of a task for hosts and logs.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub mode: ExecutionMode,
    pub owner: Option<String>,
    pub coalesce_key: Option<String>,
    pub debounce_ms: Option<u64>,
    pub periodic_ms: Option<u64>,
    pub state: TaskState,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub dispatch_count: u64,
}
