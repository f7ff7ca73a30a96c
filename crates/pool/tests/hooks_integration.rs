//! Warmup actions, reset hooks and prewarm backoff through the public facade.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use procpool::testing::{ScriptedEngine, ScriptedSession};
use procpool::{
    BoxError, Error, EventBus, LaunchSpec, LeaseScope, Pool, PoolBuilder, PoolConfig, PoolEvent,
    ResetOutcome, ResetReason, ResetRequest, RetirementReason, WorkerId,
};
use tokio::sync::broadcast::Receiver;

const WAIT: Duration = Duration::from_secs(1);

fn builder(max_size: usize) -> (PoolBuilder<ScriptedEngine>, ScriptedEngine) {
    let engine = ScriptedEngine::new();
    let builder = Pool::builder(engine.clone(), LaunchSpec::new("scripted-worker"))
        .config(PoolConfig {
            max_size,
            ..PoolConfig::default()
        })
        .prewarm_sleeper(|_| {});
    (builder, engine)
}

fn drain_events(events: &mut Receiver<PoolEvent>) -> Vec<PoolEvent> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| !matches!(event, PoolEvent::MetricsUpdated(_)))
        .collect()
}

#[test]
fn warmup_runs_once_per_launched_worker() {
    let (builder, engine) = builder(2);
    let pool = builder
        .warmup(|session: &ScriptedSession| session.execute("warmup").map(|_| ()))
        .build()
        .unwrap();

    let lease = pool.acquire_timeout(WAIT).unwrap();
    lease.execute("job").unwrap();
    lease.close();
    let lease = pool.acquire_timeout(WAIT).unwrap();

    assert_eq!(lease.commands(), vec!["warmup", "job"]);
    assert_eq!(engine.launches(), 1);
}

#[test]
fn failed_warmup_closes_the_session_and_frees_the_slot() {
    let (builder, engine) = builder(1);
    let pool = builder
        .warmup(|_: &ScriptedSession| -> Result<(), BoxError> { Err("not ready".into()) })
        .build()
        .unwrap();

    let error = pool.acquire_timeout(WAIT).unwrap_err();
    assert!(matches!(error, Error::WarmupFailed { worker_id, .. } if worker_id == WorkerId::new(1)));
    assert!(error.is_retryable());
    assert_eq!(engine.closed_sessions(), vec![1]);

    let metrics = pool.snapshot();
    assert_eq!(metrics.failed_launch_attempts, 1);
    assert_eq!(metrics.launching_workers, 0);
    assert_eq!(metrics.total_workers, 0);
}

#[test]
fn panicking_warmup_is_reported_as_failure() {
    let (builder, engine) = builder(1);
    let pool = builder
        .warmup(|_: &ScriptedSession| -> Result<(), BoxError> { panic!("warmup exploded") })
        .build()
        .unwrap();

    match pool.acquire_timeout(WAIT) {
        Err(Error::WarmupFailed { source, .. }) => {
            assert_eq!(source.to_string(), "warmup action panicked: warmup exploded");
        }
        other => panic!("expected a warmup failure, got {other:?}"),
    }
    assert_eq!(engine.live_sessions(), 0);
}

#[test]
fn reset_hook_can_retire_the_worker() {
    let (builder, engine) = builder(1);
    let pool = builder
        .reset_hook(
            |session: &ScriptedSession,
             _: &LeaseScope,
             _: &ResetRequest|
             -> Result<ResetOutcome, BoxError> {
                if session.commands().iter().any(|c| c == "poison") {
                    Ok(ResetOutcome::Retire)
                } else {
                    Ok(ResetOutcome::Continue)
                }
            },
        )
        .build()
        .unwrap();

    let lease = pool.acquire_timeout(WAIT).unwrap();
    lease.execute("fine").unwrap();
    lease.close();
    assert!(engine.closed_sessions().is_empty());

    let lease = pool.acquire_timeout(WAIT).unwrap();
    lease.execute("poison").unwrap();
    lease.close();
    assert_eq!(engine.closed_sessions(), vec![1]);

    let fresh = pool.acquire_timeout(WAIT).unwrap();
    assert_eq!(fresh.worker_id(), WorkerId::new(2));
}

#[test]
fn failing_and_panicking_hooks_retire_without_escaping_release() {
    for panics in [false, true] {
        let (builder, engine) = builder(1);
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let pool = builder
            .diagnostics(bus)
            .reset_hook(
                move |_: &ScriptedSession,
                      _: &LeaseScope,
                      _: &ResetRequest|
                      -> Result<ResetOutcome, BoxError> {
                    if panics {
                        panic!("hook exploded");
                    }
                    Err("cannot reset".into())
                },
            )
            .build()
            .unwrap();

        pool.acquire_timeout(WAIT).unwrap().close();
        assert_eq!(engine.closed_sessions(), vec![1]);

        let events = drain_events(&mut events);
        let failed = events
            .iter()
            .find_map(|event| match event {
                PoolEvent::WorkerFailed { worker_id, error } => Some((*worker_id, error.clone())),
                _ => None,
            })
            .expect("hook failure is reported");
        assert_eq!(failed.0, WorkerId::new(1));
        if panics {
            assert_eq!(failed.1, "reset hook panicked: hook exploded");
        } else {
            assert_eq!(failed.1, "cannot reset");
        }
        assert!(events.contains(&PoolEvent::WorkerRetired {
            worker_id: WorkerId::new(1),
            reason: RetirementReason::ResetHookFailure,
        }));
    }
}

#[test]
fn manual_reset_with_retire_flag_retires_on_release() {
    let (builder, engine) = builder(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let pool = builder
        .diagnostics(bus)
        .reset_hook(
            move |_: &ScriptedSession,
                  _: &LeaseScope,
                  request: &ResetRequest|
                  -> Result<ResetOutcome, BoxError> {
                recorded.lock().push(request.reason());
                Ok(ResetOutcome::Continue)
            },
        )
        .build()
        .unwrap();

    let lease = pool.acquire_timeout(WAIT).unwrap();
    lease.reset(ResetRequest::manual(lease.request_id()).retire());
    assert!(engine.closed_sessions().is_empty());
    lease.close();

    // A worker already flagged for retirement skips the release-time hooks.
    assert_eq!(*seen.lock(), vec![ResetReason::Manual]);
    assert_eq!(engine.closed_sessions(), vec![1]);
    assert!(drain_events(&mut events).contains(&PoolEvent::WorkerRetired {
        worker_id: WorkerId::new(1),
        reason: RetirementReason::RetireRequested,
    }));
}

#[test]
fn reset_on_a_closed_lease_is_ignored() {
    let (builder, _engine) = builder(1);
    let calls = Arc::new(Mutex::new(0usize));
    let counted = Arc::clone(&calls);
    let pool = builder
        .reset_hook(
            move |_: &ScriptedSession,
                  _: &LeaseScope,
                  _: &ResetRequest|
                  -> Result<ResetOutcome, BoxError> {
                *counted.lock() += 1;
                Ok(ResetOutcome::Continue)
            },
        )
        .build()
        .unwrap();

    let lease = pool.acquire_timeout(WAIT).unwrap();
    lease.close();
    lease.reset(ResetRequest::manual(lease.request_id()));
    assert_eq!(*calls.lock(), 1);
}

#[test]
fn hooks_run_in_registration_order() {
    let (builder, _engine) = builder(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (first, second) = (Arc::clone(&order), Arc::clone(&order));
    let pool = builder
        .reset_hook(
            move |_: &ScriptedSession,
                  _: &LeaseScope,
                  _: &ResetRequest|
                  -> Result<ResetOutcome, BoxError> {
                first.lock().push("first");
                Ok(ResetOutcome::Continue)
            },
        )
        .reset_hook(
            move |_: &ScriptedSession,
                  _: &LeaseScope,
                  _: &ResetRequest|
                  -> Result<ResetOutcome, BoxError> {
                second.lock().push("second");
                Ok(ResetOutcome::Continue)
            },
        )
        .build()
        .unwrap();

    pool.acquire_timeout(WAIT).unwrap().close();
    assert_eq!(*order.lock(), vec!["first", "second"]);
}

#[test]
fn prewarm_failures_back_off_linearly_and_reset_on_success() {
    let engine = ScriptedEngine::new();
    engine.fail_all_launches(true);
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let pool = Pool::builder(engine.clone(), LaunchSpec::new("scripted-worker"))
        .config(PoolConfig {
            min_size: 2,
            max_size: 4,
            ..PoolConfig::default()
        })
        .prewarm_sleeper(move |delay| recorded.lock().push(delay))
        .build()
        .expect("launch failures do not fail construction");

    assert_eq!(*delays.lock(), vec![Duration::from_millis(50)]);

    let error = pool.acquire_timeout(WAIT).unwrap_err();
    assert!(matches!(error, Error::LaunchFailed { .. }));
    assert_eq!(
        *delays.lock(),
        vec![
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(150),
        ]
    );

    engine.fail_all_launches(false);
    delays.lock().clear();
    let lease = pool.acquire_timeout(WAIT).unwrap();
    assert!(delays.lock().is_empty());
    drop(lease);
    assert_eq!(pool.snapshot().total_workers, 2);
}
