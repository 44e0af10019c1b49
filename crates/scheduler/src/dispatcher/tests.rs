#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use dispatch_core::{ExecutionError, OverlapPolicy, Owner, SchedulerConfig, SchedulerError, TaskId};

    use crate::channel::CompletionEvent;
    use crate::dispatcher::Dispatcher;
    use crate::task::{ExecutionMode, TaskOptions, TaskState, Work};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    fn dispatcher() -> Dispatcher {
        init_tracing();
        Dispatcher::new(SchedulerConfig::default()).unwrap()
    }

    fn value(v: serde_json::Value) -> Work {
        Work::sync(move || Ok(v.clone()))
    }

    fn sleepy(ms: u64, v: serde_json::Value) -> Work {
        Work::sync(move || {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(v.clone())
        })
    }

    fn collect(d: &mut Dispatcher, duration: Duration) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        d.run_for(duration, |_, e| events.push(e));
        events
    }

    // -- one-shot -----------------------------------------------------------

    #[test]
    fn schedule_once_delivers_one_event() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(value(json!({"temp": 21})), TaskOptions::new().owner("weather"))
            .unwrap();

        let event = d.next_event(Duration::from_secs(2)).expect("completion");
        assert_eq!(event.task_id, id);
        assert_eq!(event.owner, Some(Owner::new("weather")));
        assert_eq!(event.result(), Some(&json!({"temp": 21})));

        // Exactly one: nothing else arrives, and the record is retired.
        assert!(collect(&mut d, Duration::from_millis(100)).is_empty());
        assert!(matches!(d.task(id), Err(SchedulerError::TaskNotFound(_))));
        assert_eq!(d.metrics().completed, 1);
    }

    #[test]
    fn async_work_runs_on_the_loop() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(
                Work::future(|| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(json!("fetched"))
                }),
                TaskOptions::new(),
            )
            .unwrap();

        let event = d.next_event(Duration::from_secs(2)).expect("completion");
        assert_eq!(event.task_id, id);
        assert_eq!(event.result(), Some(&json!("fetched")));
        assert_eq!(d.metrics().executions_by_mode[&ExecutionMode::Async], 1);
    }

    #[test]
    fn failing_work_degrades_only_its_own_event() {
        let mut d = dispatcher();
        let bad = d
            .schedule_once(Work::sync(|| Err(anyhow::anyhow!("sensor offline"))), TaskOptions::new())
            .unwrap();
        let panicky = d
            .schedule_once(Work::sync(|| panic!("worker blew up")), TaskOptions::new())
            .unwrap();
        let bad_async = d
            .schedule_once(
                Work::future(|| async { Err(anyhow::anyhow!("timeout talking to bus")) }),
                TaskOptions::new(),
            )
            .unwrap();

        let events = collect(&mut d, Duration::from_millis(300));
        assert_eq!(events.len(), 3);
        let error_of = |id: TaskId| {
            events
                .iter()
                .find(|e| e.task_id == id)
                .and_then(|e| e.error().cloned())
        };
        assert_eq!(error_of(bad), Some(ExecutionError::Failed("sensor offline".into())));
        assert_eq!(error_of(panicky), Some(ExecutionError::Panicked("worker blew up".into())));
        assert_eq!(
            error_of(bad_async),
            Some(ExecutionError::Failed("timeout talking to bus".into()))
        );

        // Still fully operational.
        d.schedule_once(value(json!(1)), TaskOptions::new()).unwrap();
        assert!(d.next_event(Duration::from_secs(2)).unwrap().is_success());
        assert_eq!(d.metrics().failed, 3);
    }

    #[test]
    fn independent_sync_tasks_run_in_parallel() {
        let mut d = dispatcher();
        let start = Instant::now();
        d.schedule_once(sleepy(100, json!("a")), TaskOptions::new()).unwrap();
        d.schedule_once(sleepy(100, json!("b")), TaskOptions::new()).unwrap();

        assert!(d.next_event(Duration::from_secs(2)).is_some());
        assert!(d.next_event(Duration::from_secs(2)).is_some());
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(190), "took {:?}", elapsed);
    }

    // -- coalescing & debounce ------------------------------------------------

    #[test]
    fn coalesced_burst_only_runs_the_last() {
        let mut d = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for i in 0..5 {
            let runs = Arc::clone(&runs);
            let id = d
                .schedule_once(
                    Work::sync(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }),
                    TaskOptions::new().coalesce("now-playing").debounce_ms(50),
                )
                .unwrap();
            ids.push(id);
        }

        let events = collect(&mut d, Duration::from_millis(300));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, ids[4]);
        assert_eq!(events[0].result(), Some(&json!(4)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let metrics = d.metrics();
        assert_eq!(metrics.coalesced, 4);
        assert_eq!(metrics.dispatched, 1);
    }

    #[test]
    fn debounced_burst_fires_once_after_last_call() {
        let mut d = dispatcher();
        let mut last_call = Instant::now();
        let mut last_id = None;
        for i in 0..5 {
            if i > 0 {
                std::thread::sleep(Duration::from_millis(10));
            }
            last_call = Instant::now();
            last_id = Some(
                d.schedule_once(
                    value(json!({"query": i})),
                    TaskOptions::new().coalesce("search").debounce_ms(200),
                )
                .unwrap(),
            );
        }

        let event = d.next_event(Duration::from_secs(2)).expect("debounced completion");
        let waited = last_call.elapsed();
        assert_eq!(Some(event.task_id), last_id);
        assert_eq!(event.result(), Some(&json!({"query": 4})));
        assert!(waited >= Duration::from_millis(195), "fired early: {:?}", waited);
        assert!(waited < Duration::from_millis(450), "fired late: {:?}", waited);

        assert!(collect(&mut d, Duration::from_millis(250)).is_empty());
    }

    #[test]
    fn coalescing_leaves_running_holder_alone() {
        let mut d = dispatcher();
        let first = d
            .schedule_once(sleepy(80, json!("first")), TaskOptions::new().coalesce("k"))
            .unwrap();
        // `first` dispatched immediately, so it has an execution handle.
        let second = d
            .schedule_once(value(json!("second")), TaskOptions::new().coalesce("k"))
            .unwrap();

        let mut ids: Vec<TaskId> = collect(&mut d, Duration::from_millis(300))
            .into_iter()
            .map(|e| e.task_id)
            .collect();
        ids.sort_by_key(|id| id.to_string());
        let mut expected = vec![first, second];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(ids, expected);
        assert_eq!(d.metrics().coalesced, 0);
    }

    #[test]
    fn debounce_without_key_still_delays() {
        let mut d = dispatcher();
        let start = Instant::now();
        let id = d
            .schedule_once(value(json!("late")), TaskOptions::new().debounce_ms(100))
            .unwrap();
        assert!(d.has_timer(id));
        assert_eq!(d.task(id).unwrap().state, TaskState::Pending);

        let event = d.next_event(Duration::from_secs(2)).unwrap();
        assert_eq!(event.task_id, id);
        assert!(start.elapsed() >= Duration::from_millis(95));
        assert!(!d.has_timer(id));
    }

    // -- periodic -------------------------------------------------------------

    #[test]
    fn periodic_ticks_until_cancelled() {
        let mut d = dispatcher();
        let start = Instant::now();
        let id = d
            .schedule_periodic(value(json!("tick")), Duration::from_millis(100), TaskOptions::new())
            .unwrap();

        let first = d.next_event(Duration::from_secs(1)).expect("first tick");
        assert_eq!(first.task_id, id);
        let first_at = start.elapsed();
        assert!(first_at >= Duration::from_millis(95), "first tick early: {:?}", first_at);
        assert!(first_at < Duration::from_millis(250), "first tick late: {:?}", first_at);

        let more = collect(&mut d, Duration::from_millis(350));
        assert!((2..=5).contains(&more.len()), "got {} ticks", more.len());
        assert!(more.iter().all(|e| e.task_id == id));
        assert_eq!(d.task(id).unwrap().periodic_ms, Some(100));

        assert!(d.cancel(id));
        assert!(!d.has_timer(id));
        assert!(collect(&mut d, Duration::from_millis(300)).is_empty());
    }

    #[test]
    fn periodic_async_ticks() {
        let mut d = dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let id = d
            .schedule_periodic(
                Work::future(move || {
                    let c = Arc::clone(&c);
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(n))
                    }
                }),
                Duration::from_millis(50),
                TaskOptions::new().owner("clock"),
            )
            .unwrap();

        let events = collect(&mut d, Duration::from_millis(330));
        assert!(events.len() >= 3, "got {}", events.len());
        // Each tick is a fresh execution.
        let values: Vec<u64> = events.iter().filter_map(|e| e.result()?.as_u64()).collect();
        assert_eq!(values, (0..values.len() as u64).collect::<Vec<_>>());
        assert_eq!(d.cancel_owner(&Owner::new("clock")), 1);
        assert!(d.task(id).is_err());
    }

    #[test]
    fn skip_policy_drops_overlapping_ticks() {
        init_tracing();
        let config = SchedulerConfig {
            periodic_overlap: OverlapPolicy::Skip,
            ..SchedulerConfig::default()
        };
        let mut d = Dispatcher::new(config).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (r, m) = (Arc::clone(&running), Arc::clone(&max_running));
        d.schedule_periodic(
            Work::sync(move || {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(120));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }),
            Duration::from_millis(20),
            TaskOptions::new(),
        )
        .unwrap();

        collect(&mut d, Duration::from_millis(400));
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(d.metrics().skipped_ticks > 0);
    }

    #[test]
    fn allow_policy_overlaps_slow_ticks() {
        let mut d = dispatcher();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (r, m) = (Arc::clone(&running), Arc::clone(&max_running));
        d.schedule_periodic(
            Work::sync(move || {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(120));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }),
            Duration::from_millis(30),
            TaskOptions::new(),
        )
        .unwrap();

        collect(&mut d, Duration::from_millis(400));
        // Two workers, so at most two ticks overlap.
        assert_eq!(max_running.load(Ordering::SeqCst), 2);
        assert_eq!(d.metrics().skipped_ticks, 0);
    }

    #[test]
    fn coalesced_periodic_task_yields_to_newer_holder() {
        let mut d = dispatcher();
        let old = d
            .schedule_periodic(value(json!("old")), Duration::from_millis(40), TaskOptions::new().coalesce("feed"))
            .unwrap();
        let first = d.next_event(Duration::from_secs(1)).unwrap();
        assert_eq!(first.task_id, old);

        let new = d
            .schedule_periodic(value(json!("new")), Duration::from_millis(40), TaskOptions::new().coalesce("feed"))
            .unwrap();
        let events = collect(&mut d, Duration::from_millis(200));
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.task_id == new || e.task_id == old));
        assert!(d.task(old).is_err(), "old holder retires at its next tick");
        assert!(d.metrics().superseded >= 1);
    }

    // -- cancellation ---------------------------------------------------------

    #[test]
    fn cancel_is_idempotent() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(value(json!(1)), TaskOptions::new().debounce_ms(100))
            .unwrap();

        assert!(d.cancel(id));
        assert!(!d.cancel(id));
        assert!(!d.cancel(TaskId::new()));
        assert!(!d.has_timer(id));
        assert!(collect(&mut d, Duration::from_millis(200)).is_empty());
        assert_eq!(d.metrics().cancelled, 1);
    }

    #[test]
    fn cancel_releases_coalesce_key() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(value(json!("a")), TaskOptions::new().coalesce("k").debounce_ms(100))
            .unwrap();
        d.cancel(id);

        let next = d
            .schedule_once(value(json!("b")), TaskOptions::new().coalesce("k").debounce_ms(20))
            .unwrap();
        let event = d.next_event(Duration::from_secs(1)).unwrap();
        assert_eq!(event.task_id, next);
        // Cancelled task was already gone, so nothing was coalesced.
        assert_eq!(d.metrics().coalesced, 0);
    }

    #[test]
    fn late_result_of_cancelled_running_task_is_dropped() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(sleepy(100, json!("too late")), TaskOptions::new())
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(d.task(id).unwrap().state, TaskState::Running);
        assert!(d.cancel(id));

        assert!(collect(&mut d, Duration::from_millis(250)).is_empty());
    }

    #[test]
    fn cancel_before_loop_picks_up_async_task() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(
                Work::future(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!("never"))
                }),
                TaskOptions::new(),
            )
            .unwrap();
        assert!(d.cancel(id));
        assert!(collect(&mut d, Duration::from_millis(350)).is_empty());
    }

    #[test]
    fn cancel_aborts_in_flight_async_task() {
        let mut d = dispatcher();
        let (started_tx, started_rx) = crossbeam::channel::bounded::<()>(1);
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let id = d
            .schedule_once(
                Work::future(move || {
                    let started_tx = started_tx.clone();
                    let done = Arc::clone(&done);
                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        done.store(true, Ordering::SeqCst);
                        Ok(json!("never"))
                    }
                }),
                TaskOptions::new(),
            )
            .unwrap();

        // Wait until the future is actually suspended on the loop.
        started_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("async task started");
        assert_eq!(d.task(id).unwrap().state, TaskState::Running);

        assert!(d.cancel(id));
        assert!(collect(&mut d, Duration::from_millis(350)).is_empty());
        assert!(!finished.load(Ordering::SeqCst), "aborted future ran to completion");
        assert_eq!(d.metrics().dropped_stale, 0);
    }

    #[test]
    fn cancel_owner_only_touches_that_owner() {
        let mut d = dispatcher();
        for _ in 0..3 {
            d.schedule_once(value(json!("a")), TaskOptions::new().owner("panel-a").debounce_ms(50))
                .unwrap();
        }
        let keep = d
            .schedule_once(value(json!("b")), TaskOptions::new().owner("panel-b").debounce_ms(50))
            .unwrap();

        assert_eq!(d.tasks_for_owner(&Owner::new("panel-a")).len(), 3);
        assert_eq!(d.cancel_owner(&Owner::new("panel-a")), 3);
        assert_eq!(d.cancel_owner(&Owner::new("panel-a")), 0);

        let events = collect(&mut d, Duration::from_millis(200));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, keep);
    }

    // -- validation & configuration ------------------------------------------

    #[test]
    fn non_positive_intervals_are_rejected() {
        let mut d = dispatcher();
        let err = d
            .schedule_once(value(json!(1)), TaskOptions::new().debounce(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { field: "debounce" }));

        let err = d
            .schedule_periodic(value(json!(1)), Duration::ZERO, TaskOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { field: "periodic" }));
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn unrepresentable_intervals_are_rejected_before_registration() {
        let mut d = dispatcher();
        let err = d
            .schedule_once(
                value(json!(1)),
                TaskOptions::new().coalesce("k").debounce(Duration::MAX),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { field: "debounce" }));
        let err = d
            .schedule_periodic(value(json!(1)), Duration::MAX, TaskOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInterval { field: "periodic" }));
        assert_eq!(d.pending_count(), 0);

        // The coalesce key was never claimed, so a new holder is not coalesced.
        d.schedule_once(value(json!(2)), TaskOptions::new().coalesce("k"))
            .unwrap();
        assert!(d.next_event(Duration::from_secs(1)).is_some());
        assert_eq!(d.metrics().coalesced, 0);
    }

    #[test]
    fn unbounded_waits_do_not_overflow() {
        let mut d = dispatcher();
        let id = d.schedule_once(value(json!("ready")), TaskOptions::new()).unwrap();

        let event = d.next_event(Duration::MAX).expect("completion");
        assert_eq!(event.task_id, id);
        assert!(d.next_event(Duration::ZERO).is_none());
    }

    #[test]
    fn async_work_without_loop_is_not_configured() {
        init_tracing();
        let config = SchedulerConfig {
            async_loop: false,
            ..SchedulerConfig::default()
        };
        let mut d = Dispatcher::new(config).unwrap();
        assert!(!d.has_async_loop());

        let err = d
            .schedule_once(Work::future(|| async { Ok(json!(1)) }), TaskOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotConfigured(_)));

        // Sync work is unaffected.
        d.schedule_once(value(json!(2)), TaskOptions::new()).unwrap();
        assert!(d.next_event(Duration::from_secs(1)).is_some());
    }

    #[test]
    fn snapshots_describe_registered_tasks() {
        let mut d = dispatcher();
        let id = d
            .schedule_once(
                value(json!(1)),
                TaskOptions::new().owner("w").coalesce("k").debounce_ms(500).priority(7),
            )
            .unwrap();

        let snap = d.task(id).unwrap();
        assert_eq!(snap.owner.as_deref(), Some("w"));
        assert_eq!(snap.coalesce_key.as_deref(), Some("k"));
        assert_eq!(snap.debounce_ms, Some(500));
        assert_eq!(snap.priority, 7);
        assert_eq!(snap.dispatch_count, 0);
        assert_eq!(d.tasks().len(), 1);
        assert_eq!(d.pending_count(), 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["mode"], "sync");
    }

    // -- shutdown -------------------------------------------------------------

    #[test]
    fn shutdown_rejects_further_work() {
        let mut d = dispatcher();
        d.schedule_periodic(value(json!(1)), Duration::from_millis(30), TaskOptions::new())
            .unwrap();
        d.schedule_once(value(json!(2)), TaskOptions::new().debounce_ms(500))
            .unwrap();

        let start = Instant::now();
        d.shutdown(true);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(d.is_shut_down());
        assert_eq!(d.pending_count(), 0);

        let err = d.schedule_once(value(json!(3)), TaskOptions::new()).unwrap_err();
        assert!(matches!(err, SchedulerError::ShutDown));
        let err = d
            .schedule_periodic(value(json!(3)), Duration::from_millis(10), TaskOptions::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ShutDown));

        // Idempotent, and the pump stays harmless.
        d.shutdown(true);
        assert!(d.drain().is_empty());
        assert!(d.next_event(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn shutdown_is_bounded_by_stuck_work() {
        init_tracing();
        let config = SchedulerConfig {
            shutdown_timeout_ms: 100,
            ..SchedulerConfig::default()
        };
        let mut d = Dispatcher::new(config).unwrap();
        d.schedule_once(sleepy(1_000, json!("stuck")), TaskOptions::new()).unwrap();
        d.schedule_once(
            Work::future(|| async {
                // Blocks the loop thread without yielding.
                std::thread::sleep(Duration::from_millis(1_000));
                Ok(json!("stuck"))
            }),
            TaskOptions::new(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        d.shutdown(true);
        assert!(start.elapsed() < Duration::from_millis(700), "took {:?}", start.elapsed());
    }

    #[test]
    fn shutdown_without_wait_returns_promptly() {
        let mut d = dispatcher();
        for _ in 0..4 {
            d.schedule_once(sleepy(300, json!(0)), TaskOptions::new()).unwrap();
        }
        let start = Instant::now();
        d.shutdown(false);
        assert!(start.elapsed() < Duration::from_millis(250), "took {:?}", start.elapsed());
    }

    #[test]
    fn follow_up_work_from_event_handler() {
        let mut d = dispatcher();
        d.schedule_once(value(json!(1)), TaskOptions::new().owner("chain")).unwrap();

        let mut seen = Vec::new();
        d.run_for(Duration::from_millis(300), |d, event| {
            let n = event.result().and_then(|v| v.as_u64()).unwrap_or(0);
            seen.push(n);
            if n < 3 {
                d.schedule_once(value(json!(n + 1)), TaskOptions::new().owner("chain"))
                    .unwrap();
            }
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
