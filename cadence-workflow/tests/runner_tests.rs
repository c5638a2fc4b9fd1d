use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::RetryPolicy;
use cadence_workflow::{
    decode_version_details, CommandResult, CommandSink, DeterministicRunner, RunnerError,
    RunnerStatus, ThreadStatus, VersionDetails, VirtualClock, WorkflowCommand, WorkflowError,
    DEFAULT_VERSION, SIDE_EFFECT_MARKER_NAME, STACK_TRACE_QUERY_NAME, VERSION_MARKER_NAME,
};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

fn clock_at(millis: i64) -> Arc<VirtualClock> {
    Arc::new(VirtualClock::new(millis))
}

#[test]
fn test_sleeps_follow_the_clock() {
    let clock = clock_at(0);
    let trace = Trace::default();
    let t = trace.clone();
    let mut runner = DeterministicRunner::new(clock.clone(), move |ctx| async move {
        t.push("started");
        ctx.sleep(Duration::from_millis(60_000)).await?;
        t.push("afterSleep1");
        ctx.sleep(Duration::from_millis(60_000)).await?;
        t.push("done");
        Ok::<_, WorkflowError>(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(trace.entries(), vec!["started"]);
    assert_eq!(runner.status(), RunnerStatus::AllBlocked);
    assert_eq!(runner.next_wake_up_time(), Some(60_000));

    clock.set_millis(20_000);
    runner.run_until_all_blocked().unwrap();
    assert_eq!(trace.entries(), vec!["started"]);
    assert!(!runner.is_done());

    clock.set_millis(70_000);
    runner.run_until_all_blocked().unwrap();
    assert_eq!(trace.entries(), vec!["started", "afterSleep1"]);
    assert_eq!(runner.next_wake_up_time(), Some(130_000));
    assert!(!runner.is_done());

    clock.set_millis(200_000);
    runner.run_until_all_blocked().unwrap();
    assert_eq!(trace.entries(), vec!["started", "afterSleep1", "done"]);
    assert!(runner.is_done());
    assert_eq!(runner.root_result(), Some(Ok(Vec::new())));
}

#[test]
fn test_exit_from_child_stops_instance() {
    let trace = Trace::default();
    let t = trace.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        t.push("root started");
        let t1 = t.clone();
        let child1 = ctx.spawn("child1", move |c| async move {
            t1.push("child1 started");
            c.await_condition("forever", || false).await?;
            t1.push("child1 done");
            Ok(())
        });
        let t2 = t.clone();
        let _child2 = ctx.spawn("child2", move |c| async move {
            t2.push("child2 started");
            c.signal_channel("finish").recv(&c).await?;
            t2.push("child2 exiting");
            c.exit(b"exitValue".to_vec()).await;
            t2.push("after exit");
            Ok(())
        });
        child1.join(&ctx).await?;
        t.push("root done");
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(
        trace.entries(),
        vec!["root started", "child1 started", "child2 started"]
    );
    assert!(!runner.is_done());
    assert_eq!(runner.exit_value(), None);

    runner.signal("finish", None);
    runner.run_until_all_blocked().unwrap();
    assert_eq!(
        trace.entries(),
        vec!["root started", "child1 started", "child2 started", "child2 exiting"]
    );
    assert_eq!(runner.exit_value(), Some(b"exitValue".to_vec()));
    assert!(runner.is_done());
}

fn runnable_count(snapshots: &[cadence_workflow::ThreadSnapshot]) -> usize {
    snapshots
        .iter()
        .filter(|s| s.status == ThreadStatus::Runnable)
        .count()
}

#[test]
fn test_only_one_thread_runs_at_a_time() {
    let clock = clock_at(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let root_seen = seen.clone();
    let mut runner = DeterministicRunner::new(clock.clone(), move |ctx| async move {
        root_seen.lock().push(runnable_count(&ctx.thread_snapshots()));
        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let seen = root_seen.clone();
            handles.push(ctx.spawn(name, move |c| async move {
                seen.lock().push(runnable_count(&c.thread_snapshots()));
                c.yield_now("yield").await?;
                seen.lock().push(runnable_count(&c.thread_snapshots()));
                c.sleep(Duration::from_secs(1)).await?;
                seen.lock().push(runnable_count(&c.thread_snapshots()));
                Ok(())
            }));
        }
        root_seen.lock().push(runnable_count(&ctx.thread_snapshots()));
        for handle in &handles {
            handle.join(&ctx).await?;
        }
        root_seen.lock().push(runnable_count(&ctx.thread_snapshots()));
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.status(), RunnerStatus::AllBlocked);
    assert_eq!(runnable_count(&runner.thread_snapshots()), 0);

    clock.set_millis(1_000);
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(runnable_count(&runner.thread_snapshots()), 0);

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 3 + 3 * 3);
    assert!(seen.iter().all(|&count| count == 1), "{:?}", seen);
}

#[test]
fn test_blocked_threads_stay_blocked_until_unblocked() {
    let flag = Arc::new(AtomicBool::new(false));
    let gate = flag.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let waiter = ctx.spawn("waiter", move |c| async move {
            c.await_condition("gate", move || gate.load(Ordering::SeqCst))
                .await?;
            Ok(())
        });
        waiter.join(&ctx).await?;
        Ok(Vec::new())
    });

    for _ in 0..3 {
        runner.run_until_all_blocked().unwrap();
        let snapshots = runner.thread_snapshots();
        assert_eq!(runnable_count(&snapshots), 0);
        assert!(snapshots
            .iter()
            .all(|s| s.status == ThreadStatus::Blocked));
    }

    flag.store(true, Ordering::SeqCst);
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
}

#[test]
fn test_yield_interleaves_in_creation_order() {
    let trace = Trace::default();
    let t = trace.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let t = t.clone();
            handles.push(ctx.spawn(name, move |c| async move {
                t.push(format!("{}1", name));
                c.yield_now("yield").await?;
                t.push(format!("{}2", name));
                Ok(())
            }));
        }
        for handle in &handles {
            handle.join(&ctx).await?;
        }
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(trace.entries(), vec!["a1", "b1", "a2", "b2"]);
    assert!(runner.is_done());
}

#[test]
fn test_root_failure_is_reported() {
    let mut runner = DeterministicRunner::new(clock_at(0), |_ctx| async move {
        Err::<Vec<u8>, _>(WorkflowError::Generic("boom".to_string()))
    });

    let err = runner.run_until_all_blocked().unwrap_err();
    assert_eq!(
        err,
        RunnerError::WorkflowFailed(WorkflowError::Generic("boom".to_string()))
    );
    assert!(runner.is_done());
    assert!(matches!(
        runner.run_until_all_blocked(),
        Err(RunnerError::Closed)
    ));
}

#[test]
fn test_root_panic_fails_workflow() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        ctx.yield_now("before panic").await?;
        if ctx.current_time_millis() == 0 {
            panic!("workflow bug");
        }
        Ok(Vec::new())
    });

    let err = runner.run_until_all_blocked().unwrap_err();
    assert_eq!(
        err,
        RunnerError::WorkflowFailed(WorkflowError::Panic("workflow bug".to_string()))
    );
    assert!(runner.is_done());
}

#[test]
fn test_close_reports_swallowed_destroy() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        let child = ctx.spawn("swallower", |c| async move {
            let _ = c.await_condition("never", || false).await;
            Ok(())
        });
        child.join(&ctx).await?;
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.status(), RunnerStatus::AllBlocked);

    let err = runner.close().unwrap_err();
    assert_eq!(
        err,
        RunnerError::DestroySwallowed {
            threads: vec!["swallower".to_string()]
        }
    );
    assert!(runner.is_done());
    assert!(runner.close().is_ok());
}

#[test]
fn test_close_unwinds_blocked_threads() {
    let unwound = Arc::new(AtomicBool::new(false));
    let flag = unwound.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let result = ctx.await_condition("never", || false).await;
        flag.store(result == Err(WorkflowError::Destroyed), Ordering::SeqCst);
        result?;
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    runner.close().unwrap();
    assert!(unwound.load(Ordering::SeqCst));
    assert!(runner.is_done());
}

#[test]
fn test_join_timeout_uses_runner_clock() {
    let clock = clock_at(0);
    let mut runner = DeterministicRunner::new(clock.clone(), |ctx| async move {
        let child = ctx.spawn("slow", |c| async move {
            c.await_condition("forever", || false).await?;
            Ok(1)
        });
        match child.join_timeout(&ctx, Duration::from_secs(61)).await? {
            Some(_) => Ok(b"joined".to_vec()),
            None => Ok(b"timed out".to_vec()),
        }
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.next_wake_up_time(), Some(61_000));

    clock.set_millis(60_999);
    runner.run_until_all_blocked().unwrap();
    assert!(!runner.is_done());

    clock.set_millis(61_000);
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(runner.root_result(), Some(Ok(b"timed out".to_vec())));
}

#[test]
fn test_join_timeout_returns_result_when_child_finishes_first() {
    let clock = clock_at(0);
    let mut runner = DeterministicRunner::new(clock.clone(), |ctx| async move {
        let child = ctx.spawn("quick", |c| async move {
            c.sleep(Duration::from_secs(5)).await?;
            Ok(7u32)
        });
        let value = child.join_timeout(&ctx, Duration::from_secs(60)).await?;
        Ok(serde_json::to_vec(&value)?)
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.next_wake_up_time(), Some(5_000));
    clock.set_millis(5_000);
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(runner.root_result(), Some(Ok(b"7".to_vec())));
    assert_eq!(runner.next_wake_up_time(), None);
}

#[test]
fn test_child_tree_completes_bottom_up() {
    let trace = Trace::default();
    let t = trace.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let t1 = t.clone();
        let parent = ctx.spawn("parent", move |c| async move {
            let t2 = t1.clone();
            let grandchild = c.spawn("grandchild", move |g| async move {
                g.yield_now("work").await?;
                t2.push("grandchild done");
                Ok(())
            });
            grandchild.join(&c).await?;
            t1.push("parent done");
            Ok(())
        });
        parent.join(&ctx).await?;
        t.push("root done");
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(
        trace.entries(),
        vec!["grandchild done", "parent done", "root done"]
    );
    assert!(runner.is_done());
}

#[test]
fn test_runner_cancel_reaches_root() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        ctx.await_condition("never", || false).await?;
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    runner.cancel("stop");
    assert!(runner.is_cancel_requested());
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(
        runner.root_result(),
        Some(Err(WorkflowError::Canceled("stop".to_string())))
    );
}

#[test]
fn test_explicit_scope_cancels_only_its_threads() {
    let trace = Trace::default();
    let t = trace.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let scoped = ctx.new_cancellation_scope();
        let child = scoped.spawn("scoped", |c| async move {
            c.await_condition("never", || false).await?;
            Ok(())
        });
        ctx.yield_now("let child block").await?;
        scoped.cancellation_scope().cancel("scope closed");
        let joined = child.join(&ctx).await;
        t.push(format!("{:?}", joined));
        t.push(format!("root cancelled: {}", ctx.is_cancel_requested()));
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(
        trace.entries(),
        vec![
            "Err(Canceled(\"scope closed\"))".to_string(),
            "root cancelled: false".to_string()
        ]
    );
    assert_eq!(runner.root_result(), Some(Ok(Vec::new())));
}

#[test]
fn test_detached_scope_ignores_parent_cancellation() {
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();
    let mut runner = DeterministicRunner::new(clock_at(0), move |ctx| async move {
        let detached = ctx.new_detached_cancellation_scope();
        let child = detached.spawn("detached", move |c| async move {
            c.await_condition("release", move || gate.load(Ordering::SeqCst))
                .await?;
            Ok(b"released".to_vec())
        });
        child.join(&ctx).await
    });

    runner.run_until_all_blocked().unwrap();
    runner.cancel("outer");
    runner.run_until_all_blocked().unwrap();
    assert!(!runner.is_done());
    let detached = runner
        .thread_snapshots()
        .into_iter()
        .find(|s| s.name == "detached")
        .unwrap();
    assert_eq!(detached.status, ThreadStatus::Blocked);
    assert_eq!(detached.blocked_reason.as_deref(), Some("release"));

    release.store(true, Ordering::SeqCst);
    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(runner.root_result(), Some(Ok(b"released".to_vec())));
}

#[test]
fn test_thread_cancel_interrupts_sleep() {
    let clock = clock_at(0);
    let mut runner = DeterministicRunner::new(clock.clone(), |ctx| async move {
        let child = ctx.spawn("sleeper", |c| async move {
            c.sleep(Duration::from_secs(3600)).await?;
            Ok(())
        });
        ctx.yield_now("let child start").await?;
        ctx.yield_now("let child sleep").await?;
        child.cancel("no longer needed");
        match child.join(&ctx).await {
            Err(WorkflowError::Canceled(reason)) => Ok(reason.into_bytes()),
            other => Err(WorkflowError::Generic(format!("unexpected {:?}", other))),
        }
    });

    runner.run_until_all_blocked().unwrap();
    assert!(runner.is_done());
    assert_eq!(
        runner.root_result(),
        Some(Ok(b"no longer needed".to_vec()))
    );
    assert_eq!(runner.next_wake_up_time(), None);
}

#[test]
fn test_cancel_before_first_run() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        let child = ctx.new_thread("early", |c| async move {
            c.sleep(Duration::from_secs(1)).await?;
            Ok(())
        });
        child.cancel("early");
        child.start();
        let joined = child.join(&ctx).await;
        Ok(format!("{:?}", joined).into_bytes())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(
        runner.root_result(),
        Some(Ok(b"Err(Canceled(\"early\"))".to_vec()))
    );
    assert_eq!(runner.next_wake_up_time(), None);
}

#[test]
fn test_signals_are_delivered_in_order() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        let channel = ctx.signal_channel("greeting");
        let mut received = Vec::new();
        for _ in 0..2 {
            let input = channel.recv(&ctx).await?.unwrap_or_default();
            received.push(String::from_utf8_lossy(&input).into_owned());
        }
        Ok(received.join(",").into_bytes())
    });

    runner.run_until_all_blocked().unwrap();
    assert!(!runner.is_done());

    let sender = runner.signal_sender();
    sender.signal("greeting", Some(b"hello".to_vec()));
    sender.signal("other", None);
    runner.signal("greeting", Some(b"world".to_vec()));
    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.root_result(), Some(Ok(b"hello,world".to_vec())));
}

#[test]
fn test_query_handlers_and_stack_trace() {
    let mut runner = DeterministicRunner::new(clock_at(0), |ctx| async move {
        let state = Arc::new(Mutex::new("waiting".to_string()));
        let view = state.clone();
        ctx.register_query("state", move |_args| Ok(view.lock().clone().into_bytes()));
        ctx.await_condition("approval", || false).await?;
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.query("state", b"").unwrap(), b"waiting".to_vec());
    assert_eq!(
        runner.query("missing", b""),
        Err(RunnerError::UnknownQuery("missing".to_string()))
    );

    let dump = String::from_utf8(runner.query(STACK_TRACE_QUERY_NAME, b"").unwrap()).unwrap();
    assert!(dump.contains("workflow-root"));
    assert!(dump.contains("approval"));
}

struct RecordingSink {
    recorded: Option<Vec<u8>>,
    markers: Mutex<Vec<String>>,
}

impl CommandSink for RecordingSink {
    fn submit(&self, command: WorkflowCommand) -> Result<CommandResult, WorkflowError> {
        if let WorkflowCommand::RecordMarker(marker) = command {
            self.markers.lock().push(marker.marker_name);
        }
        Ok(CommandResult::Accepted)
    }

    fn is_replaying(&self) -> bool {
        self.recorded.is_some()
    }

    fn recorded_side_effect(&self, _side_effect_id: u64) -> Result<Option<Vec<u8>>, WorkflowError> {
        Ok(self.recorded.clone())
    }
}

#[test]
fn test_side_effect_runs_once_and_records_marker() {
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let sink = Arc::new(RecordingSink {
        recorded: None,
        markers: Mutex::new(Vec::new()),
    });
    let mut runner = DeterministicRunner::builder()
        .clock(clock_at(0))
        .command_sink(sink.clone())
        .build(move |ctx| async move {
            let value: u32 = ctx.side_effect(|| {
                *counter.lock() += 1;
                42
            })?;
            Ok(serde_json::to_vec(&value)?)
        });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.root_result(), Some(Ok(b"42".to_vec())));
    assert_eq!(*calls.lock(), 1);
    assert_eq!(*sink.markers.lock(), vec![SIDE_EFFECT_MARKER_NAME.to_string()]);
}

#[test]
fn test_side_effect_replays_recorded_value() {
    let sink = Arc::new(RecordingSink {
        recorded: Some(b"7".to_vec()),
        markers: Mutex::new(Vec::new()),
    });
    let mut runner = DeterministicRunner::builder()
        .clock(clock_at(0))
        .command_sink(sink.clone())
        .build(|ctx| async move {
            assert!(ctx.is_replaying());
            let value: u32 = ctx.side_effect(|| panic!("side effect must not run on replay"))?;
            Ok(serde_json::to_vec(&value)?)
        });

    runner.run_until_all_blocked().unwrap();
    assert_eq!(runner.root_result(), Some(Ok(b"7".to_vec())));
    assert_eq!(sink.markers.lock().len(), 1);
}

struct VersionSink {
    replaying: bool,
    recorded: Option<(String, i32)>,
    markers: Mutex<Vec<VersionDetails>>,
}

impl VersionSink {
    fn new(replaying: bool, recorded: Option<(&str, i32)>) -> Arc<Self> {
        Arc::new(Self {
            replaying,
            recorded: recorded.map(|(id, v)| (id.to_string(), v)),
            markers: Mutex::new(Vec::new()),
        })
    }
}

impl CommandSink for VersionSink {
    fn submit(&self, command: WorkflowCommand) -> Result<CommandResult, WorkflowError> {
        if let WorkflowCommand::RecordMarker(marker) = command {
            assert_eq!(marker.marker_name, VERSION_MARKER_NAME);
            self.markers
                .lock()
                .push(decode_version_details(&marker.details).unwrap());
        }
        Ok(CommandResult::Accepted)
    }

    fn is_replaying(&self) -> bool {
        self.replaying
    }

    fn recorded_version(&self, change_id: &str) -> Result<Option<i32>, WorkflowError> {
        Ok(self
            .recorded
            .as_ref()
            .filter(|(id, _)| id == change_id)
            .map(|(_, v)| *v))
    }
}

fn run_versioned(sink: Arc<VersionSink>, min: i32, max: i32) -> Option<Result<Vec<u8>, WorkflowError>> {
    let mut runner = DeterministicRunner::builder()
        .clock(clock_at(0))
        .command_sink(sink)
        .build(move |ctx| async move {
            let first = ctx.get_version("change", min, max)?;
            let again = ctx.get_version("change", min, max)?;
            assert_eq!(first, again);
            Ok(first.to_string().into_bytes())
        });
    let _ = runner.run_until_all_blocked();
    runner.root_result()
}

#[test]
fn test_new_run_records_max_version_once() {
    let sink = VersionSink::new(false, None);
    assert_eq!(run_versioned(sink.clone(), DEFAULT_VERSION, 2), Some(Ok(b"2".to_vec())));
    assert_eq!(
        *sink.markers.lock(),
        vec![VersionDetails {
            change_id: "change".to_string(),
            version: 2
        }]
    );
}

#[test]
fn test_replay_without_marker_gets_default_version() {
    let sink = VersionSink::new(true, None);
    assert_eq!(run_versioned(sink.clone(), DEFAULT_VERSION, 2), Some(Ok(b"-1".to_vec())));
    assert!(sink.markers.lock().is_empty());
}

#[test]
fn test_replay_uses_recorded_version() {
    let sink = VersionSink::new(true, Some(("change", 1)));
    assert_eq!(run_versioned(sink.clone(), DEFAULT_VERSION, 2), Some(Ok(b"1".to_vec())));
    assert_eq!(sink.markers.lock().len(), 1);
    assert_eq!(sink.markers.lock()[0].version, 1);
}

#[test]
fn test_version_below_minimum_fails() {
    let sink = VersionSink::new(true, Some(("change", 1)));
    match run_versioned(sink, 2, 3) {
        Some(Err(WorkflowError::UnsupportedVersion {
            version,
            min_supported,
            ..
        })) => {
            assert_eq!(version, 1);
            assert_eq!(min_supported, 2);
        }
        other => panic!("expected an unsupported version, got {:?}", other),
    }
}

#[test]
fn test_retry_follows_backoff_schedule() {
    let clock = clock_at(0);
    let attempts = Trace::default();
    let t = attempts.clone();
    let mut runner = DeterministicRunner::new(clock.clone(), move |ctx| async move {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 6,
            non_retryable_error_types: Vec::new(),
            expiration_interval: Duration::ZERO,
        };
        ctx.retry(&policy, || {
            t.push(ctx.current_time_millis().to_string());
            async { Err::<(), _>(WorkflowError::Generic("flaky".to_string())) }
        })
        .await?;
        Ok(Vec::new())
    });

    runner.run_until_all_blocked().unwrap();
    while let Some(wake_up) = runner.next_wake_up_time() {
        clock.set_millis(wake_up);
        let _ = runner.run_until_all_blocked();
    }

    assert_eq!(
        attempts.entries(),
        vec!["0", "10000", "30000", "70000", "150000", "250000"]
    );
    assert!(runner.is_done());
    assert_eq!(
        runner.root_result(),
        Some(Err(WorkflowError::Generic("flaky".to_string())))
    );
}

#[test]
fn test_retry_stops_on_non_retryable_reason() {
    let clock = clock_at(0);
    let mut runner = DeterministicRunner::new(clock.clone(), |ctx| async move {
        let policy = RetryPolicy {
            maximum_attempts: 5,
            non_retryable_error_types: vec!["bad-input".to_string()],
            ..RetryPolicy::default()
        };
        ctx.retry(&policy, || async {
            Err::<(), _>(WorkflowError::Custom(cadence_core::CustomError::new(
                "bad-input",
                Vec::new(),
            )))
        })
        .await?;
        Ok(Vec::new())
    });

    let err = runner.run_until_all_blocked().unwrap_err();
    assert!(matches!(err, RunnerError::WorkflowFailed(WorkflowError::Custom(_))));
    assert_eq!(runner.next_wake_up_time(), None);
}
