use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use dispatch_core::SchedulerConfig;
use dispatch_scheduler::{CompletionEvent, Dispatcher, SchedulerMetrics, TaskOptions, Work};

use crate::cli::CliArgs;

const OWNER: &str = "demo";
const BURST_KEY: &str = "demo-burst";
const BURST_SIZE: u64 = 5;

/// What the demo observed before shutting down.
pub struct DemoReport {
    pub events: usize,
    /// Delivered events by the `kind` field of their result; failures count
    /// under `"error"`.
    pub by_kind: BTreeMap<String, usize>,
    pub metrics: SchedulerMetrics,
}

pub fn run(config: SchedulerConfig, args: &CliArgs) -> Result<DemoReport> {
    let mut dispatcher = Dispatcher::new(config).context("failed to start dispatcher")?;

    let sync_ticks = Arc::new(AtomicU64::new(0));
    let ticks = Arc::clone(&sync_ticks);
    dispatcher
        .schedule_periodic(
            Work::sync(move || {
                let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(json!({ "kind": "sync-tick", "n": n }))
            }),
            args.period,
            TaskOptions::new().owner(OWNER),
        )
        .context("failed to schedule sync tick")?;

    if dispatcher.has_async_loop() {
        let async_ticks = Arc::new(AtomicU64::new(0));
        dispatcher
            .schedule_periodic(
                Work::future(move || {
                    let ticks = Arc::clone(&async_ticks);
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                        Ok(json!({ "kind": "async-tick", "n": n }))
                    }
                }),
                args.period,
                TaskOptions::new().owner(OWNER),
            )
            .context("failed to schedule async tick")?;
    } else {
        warn!("async loop disabled, skipping async tick");
    }

    for i in 1..=BURST_SIZE {
        dispatcher
            .schedule_once(
                Work::sync(move || Ok(json!({ "kind": "burst", "call": i }))),
                TaskOptions::new()
                    .owner(OWNER)
                    .coalesce(BURST_KEY)
                    .debounce(args.debounce),
            )
            .context("failed to schedule burst call")?;
    }

    dispatcher
        .schedule_once(
            Work::sync(|| Err(anyhow::anyhow!("simulated failure"))),
            TaskOptions::new().owner(OWNER),
        )
        .context("failed to schedule failing task")?;

    info!(
        duration = ?args.duration,
        pending = dispatcher.pending_count(),
        "workload scheduled"
    );

    let mut by_kind = BTreeMap::new();
    let events = dispatcher.run_for(args.duration, |_, event| {
        log_event(&event);
        *by_kind.entry(event_kind(&event)).or_insert(0) += 1;
    });

    dispatcher.shutdown(true);
    Ok(DemoReport {
        events,
        by_kind,
        metrics: dispatcher.metrics(),
    })
}

fn log_event(event: &CompletionEvent) {
    let elapsed = event.elapsed;
    match &event.outcome {
        Ok(value) => info!(task_id = %event.task_id, ?elapsed, result = %value, "task completed"),
        Err(e) => warn!(task_id = %event.task_id, ?elapsed, error = %e, "task failed"),
    }
}

fn event_kind(event: &CompletionEvent) -> String {
    match &event.outcome {
        Ok(value) => value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("unknown")
            .to_string(),
        Err(_) => "error".to_string(),
    }
}
