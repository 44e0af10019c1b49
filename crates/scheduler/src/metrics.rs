use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::ExecutionMode;

/// Scheduler operational counters, maintained on the control context.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Accepted `schedule_once` / `schedule_periodic` calls.
    pub scheduled: u64,
    /// Executions handed to an executor (one per periodic tick).
    pub dispatched: u64,
    /// Completion events delivered with a result.
    pub completed: u64,
    /// Completion events delivered with an error.
    pub failed: u64,
    /// Tasks removed by `cancel` / `cancel_owner` / shutdown.
    pub cancelled: u64,
    /// Pending tasks detached because a newer task took their coalesce key.
    pub coalesced: u64,
    /// Tasks that found themselves superseded at dispatch time.
    pub superseded: u64,
    /// Periodic ticks dropped by the `skip` overlap policy.
    pub skipped_ticks: u64,
    /// Completion events discarded because their task was gone.
    pub dropped_stale: u64,
    /// Delivered executions by mode.
    pub executions_by_mode: HashMap<ExecutionMode, u64>,
    /// Rolling average execution time by mode.
    pub avg_execution_time: HashMap<ExecutionMode, Duration>,
    /// When the last completion was delivered.
    pub last_completion: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    /// Record a delivered completion.
    pub fn record_completion(&mut self, mode: ExecutionMode, elapsed: Duration, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        *self.executions_by_mode.entry(mode).or_default() += 1;
        self.last_completion = Some(Utc::now());

        // Update rolling average duration
        let count = self.executions_by_mode[&mode];
        let prev_avg = self.avg_execution_time.get(&mode).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            elapsed
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = elapsed.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_execution_time.insert(mode, new_avg);
    }

    /// Completed plus failed.
    pub fn delivered(&self) -> u64 {
        self.completed + self.failed
    }
}
