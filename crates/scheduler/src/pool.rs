//! Fixed-size worker pool for synchronous work, built on `rayon`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use dispatch_core::{ExecutionError, Owner, SchedulerError, TaskId};

use crate::channel::{CompletionEvent, CompletionSender};
use crate::handle::ExecutionHandle;
use crate::task::{ExecutionMode, SyncFn};
use crate::timers::deadline_after;

/// One queued synchronous execution.
pub struct SyncJob {
    pub task_id: TaskId,
    pub owner: Option<Owner>,
    pub func: SyncFn,
    pub sink: CompletionSender,
}

/// Runs synchronous callables on `threads` dedicated workers.
///
/// Items are taken in FIFO order; completion order across items is
/// unspecified. Workers never touch the registry except through the
/// completion sink's liveness check.
pub struct SyncExecutionPool {
    pool: rayon::ThreadPool,
    threads: usize,
    /// Queued plus running jobs.
    in_flight: Arc<AtomicUsize>,
}

impl SyncExecutionPool {
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("dispatch-worker-{}", i))
            .build()
            .map_err(|e| SchedulerError::Pool(e.to_string()))?;
        info!(threads, "sync execution pool started");
        Ok(Self {
            pool,
            threads,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Enqueue a job and return its handle immediately.
    pub fn submit(&self, job: SyncJob) -> ExecutionHandle {
        let handle = ExecutionHandle::new(ExecutionMode::Sync);
        let worker_handle = handle.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);

        self.pool.spawn_fifo(move || {
            run_job(job, &worker_handle);
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        handle
    }

    /// Stop accepting work. With `wait`, block until in-flight jobs drain or
    /// `timeout` passes; workers still busy after that are abandoned.
    pub fn shutdown(self, wait: bool, timeout: Duration) -> Result<(), SchedulerError> {
        let outcome = if wait {
            let deadline = deadline_after(Instant::now(), timeout);
            loop {
                let remaining = self.in_flight();
                if remaining == 0 {
                    break Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(remaining, ?timeout, "sync pool did not drain before timeout, abandoning workers");
                    break Err(SchedulerError::ShutdownTimeout {
                        component: "sync execution pool",
                        timeout,
                    });
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        } else {
            Ok(())
        };
        // Dropping the rayon pool lets idle workers exit; it never blocks.
        drop(self.pool);
        info!("sync execution pool stopped");
        outcome
    }
}

fn run_job(job: SyncJob, handle: &ExecutionHandle) {
    if !handle.try_start() {
        debug!(task_id = %job.task_id, "sync job cancelled before start");
        return;
    }

    let started = Instant::now();
    let func = Arc::clone(&job.func);
    let outcome = match catch_unwind(AssertUnwindSafe(|| func())) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionError::Failed(format!("{:#}", e))),
        Err(payload) => Err(ExecutionError::from_panic(payload)),
    };
    let elapsed = started.elapsed();
    handle.mark_finished();

    if let Err(e) = &outcome {
        warn!(task_id = %job.task_id, error = %e, "sync task failed");
    }
    job.sink
        .post(CompletionEvent::new(job.task_id, job.owner, outcome, elapsed));
}
