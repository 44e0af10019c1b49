//! In-process task scheduler.
//!
//! Work is submitted from a single control context and executed either on a
//! fixed-size sync worker pool or on one dedicated cooperative async loop.
//! Completions travel back over a thread-safe [`ResultChannel`] and are
//! drained by the control context through the [`Dispatcher`], which also
//! drives debounce and periodic timers.

pub mod async_loop;
pub mod channel;
pub mod dispatcher;
pub mod handle;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod task;
pub mod timers;

pub use async_loop::AsyncExecutionLoop;
pub use channel::{CompletionEvent, CompletionSender, ResultChannel};
pub use dispatcher::Dispatcher;
pub use handle::ExecutionHandle;
pub use metrics::SchedulerMetrics;
pub use pool::SyncExecutionPool;
pub use registry::TaskRegistry;
pub use task::{ExecutionMode, ScheduledTask, TaskOptions, TaskOutput, TaskSnapshot, TaskState, Work};
pub use timers::{TimerKind, TimerSet};

pub use dispatch_core::{ExecutionError, OverlapPolicy, Owner, SchedulerConfig, SchedulerError, TaskId};
