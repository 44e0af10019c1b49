use tracing::info;

use dispatch_core::{Owner, SchedulerConfig, SchedulerError, TaskId};

use crate::async_loop::AsyncExecutionLoop;
use crate::channel::ResultChannel;
use crate::metrics::SchedulerMetrics;
use crate::pool::SyncExecutionPool;
use crate::registry::TaskRegistry;
use crate::task::TaskSnapshot;
use crate::timers::TimerSet;

/// The task scheduler, owned by the control context.
///
/// Every method takes `&mut self`: scheduling, cancellation, timer firing
/// and result consumption all happen on the thread that owns the
/// dispatcher, so their effects are observed in issuance order.
pub struct Dispatcher {
    pub(super) config: SchedulerConfig,
    /// Task records and coalesce holders, shared with producer threads.
    pub(super) registry: TaskRegistry,
    /// Debounce and periodic timers; control context only.
    pub(super) timers: TimerSet,
    pub(super) pool: Option<SyncExecutionPool>,
    pub(super) async_loop: Option<AsyncExecutionLoop>,
    pub(super) results: ResultChannel,
    pub(super) metrics: SchedulerMetrics,
    pub(super) shut_down: bool,
}

impl Dispatcher {
    /// Start the worker pool and, if configured, the async loop thread.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let pool = SyncExecutionPool::new(config.resolved_worker_threads())?;
        let async_loop = if config.async_loop {
            Some(AsyncExecutionLoop::start(config.loop_start_timeout())?)
        } else {
            None
        };

        let registry = TaskRegistry::new();
        let results = ResultChannel::new(registry.clone());

        info!(
            workers = pool.threads(),
            async_loop = async_loop.is_some(),
            overlap = %config.periodic_overlap,
            "dispatcher started"
        );

        Ok(Self {
            config,
            registry,
            timers: TimerSet::new(),
            pool: Some(pool),
            async_loop,
            results,
            metrics: SchedulerMetrics::default(),
            shut_down: false,
        })
    }

    pub fn with_defaults() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.clone()
    }

    /// Look up a registered task.
    pub fn task(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.registry
            .get(id)
            .map(|t| t.snapshot())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Snapshots of every registered task.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.snapshot_all().iter().map(|t| t.snapshot()).collect()
    }

    pub fn tasks_for_owner(&self, owner: &Owner) -> Vec<TaskId> {
        self.registry.ids_for_owner(owner)
    }

    /// Registered tasks: pending, running, or periodic.
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn has_timer(&self, id: TaskId) -> bool {
        self.timers.contains(id)
    }

    pub fn has_async_loop(&self) -> bool {
        self.async_loop.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}
