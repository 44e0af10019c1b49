//! Dedicated thread running a single-threaded tokio runtime for async work.
//!
//! Submissions cross into the loop over an unbounded channel, which is safe
//! to use from any thread. The loop thread owns a [`JoinSet`] of everything
//! in flight, so stopping can abort all of it and wait for the aborts to
//! settle before the runtime is dropped.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel as xchan;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dispatch_core::{ExecutionError, Owner, SchedulerError, TaskId};

use crate::channel::{CompletionEvent, CompletionSender};
use crate::handle::ExecutionHandle;
use crate::task::{ExecutionMode, TaskOutput};
use crate::timers::deadline_after;

/// One async execution handed to the loop.
pub struct AsyncJob {
    pub task_id: TaskId,
    pub owner: Option<Owner>,
    pub future: BoxFuture<'static, TaskOutput>,
    pub sink: CompletionSender,
}

enum LoopCommand {
    Spawn(AsyncJob, ExecutionHandle),
    Stop,
}

/// Handle to the loop thread. Exactly one thread per instance.
pub struct AsyncExecutionLoop {
    commands: mpsc::UnboundedSender<LoopCommand>,
    thread: Option<JoinHandle<()>>,
    exited: xchan::Receiver<()>,
    in_flight: Arc<AtomicUsize>,
}

impl AsyncExecutionLoop {
    /// Spawn the loop thread and wait up to `start_timeout` for its runtime.
    pub fn start(start_timeout: Duration) -> Result<Self, SchedulerError> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = xchan::bounded::<Result<(), String>>(1);
        let (exited_tx, exited) = xchan::bounded::<()>(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let loop_in_flight = Arc::clone(&in_flight);

        let thread = std::thread::Builder::new()
            .name("dispatch-async-loop".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(run_loop(receiver, loop_in_flight));
                drop(runtime);
                let _ = exited_tx.send(());
            })
            .map_err(|e| SchedulerError::LoopUnavailable(e.to_string()))?;

        match ready_rx.recv_timeout(start_timeout) {
            Ok(Ok(())) => {
                info!("async execution loop started");
                Ok(Self {
                    commands,
                    thread: Some(thread),
                    exited,
                    in_flight,
                })
            }
            Ok(Err(e)) => Err(SchedulerError::LoopUnavailable(e)),
            Err(_) => Err(SchedulerError::LoopUnavailable(format!(
                "loop thread did not start within {:?}",
                start_timeout
            ))),
        }
    }

    /// Number of submitted jobs that have not settled yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Hand a job to the loop thread. Callable from any thread.
    pub fn submit(&self, job: AsyncJob) -> Result<ExecutionHandle, SchedulerError> {
        let handle = ExecutionHandle::new(ExecutionMode::Async);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self
            .commands
            .send(LoopCommand::Spawn(job, handle.clone()))
            .is_err()
        {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::LoopUnavailable("loop thread has stopped".to_string()));
        }
        Ok(handle)
    }

    /// Halt the loop: abort pending work, wait for the aborts, join the
    /// thread. Gives up after `timeout` and leaves the thread detached.
    pub fn stop(mut self, timeout: Duration) -> Result<(), SchedulerError> {
        let _ = self.commands.send(LoopCommand::Stop);
        let deadline = deadline_after(Instant::now(), timeout);

        match self.exited.recv_deadline(deadline) {
            Ok(()) | Err(xchan::RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        warn!("async loop thread panicked during shutdown");
                    }
                }
                info!("async execution loop stopped");
                Ok(())
            }
            Err(xchan::RecvTimeoutError::Timeout) => {
                warn!(?timeout, "async loop did not stop in time, abandoning thread");
                // Dropping the JoinHandle detaches the thread.
                self.thread.take();
                Err(SchedulerError::ShutdownTimeout {
                    component: "async execution loop",
                    timeout,
                })
            }
        }
    }
}

impl Drop for AsyncExecutionLoop {
    fn drop(&mut self) {
        // Never blocks; an explicit stop() has already taken the thread.
        if self.thread.is_some() {
            let _ = self.commands.send(LoopCommand::Stop);
        }
    }
}

async fn run_loop(mut commands: mpsc::UnboundedReceiver<LoopCommand>, in_flight: Arc<AtomicUsize>) {
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LoopCommand::Spawn(job, handle)) => {
                    let task_id = job.task_id;
                    let counter = Arc::clone(&in_flight);
                    let attached = handle.attach(|| {
                        tasks.spawn(execute(job, handle.clone(), counter))
                    });
                    if !attached {
                        debug!(task_id = %task_id, "async job cancelled before start");
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                Some(LoopCommand::Stop) | None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_cancelled() {
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    } else {
                        warn!(error = %e, "async job terminated abnormally");
                    }
                }
            }
        }
    }

    let pending = tasks.len();
    if pending > 0 {
        debug!(pending, "cancelling pending async jobs");
    }
    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        // Cancellation errors are expected here.
        if let Err(e) = joined {
            if e.is_cancelled() {
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

async fn execute(job: AsyncJob, handle: ExecutionHandle, in_flight: Arc<AtomicUsize>) {
    let started = Instant::now();
    let outcome = match AssertUnwindSafe(job.future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionError::Failed(format!("{:#}", e))),
        Err(payload) => Err(ExecutionError::from_panic(payload)),
    };
    let elapsed = started.elapsed();
    handle.mark_finished();
    in_flight.fetch_sub(1, Ordering::AcqRel);

    if let Err(e) = &outcome {
        warn!(task_id = %job.task_id, error = %e, "async task failed");
    }
    job.sink
        .post(CompletionEvent::new(job.task_id, job.owner, outcome, elapsed));
}
