//! Event stream emitted through `EventBus` over a pool's lifetime.

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use procpool::testing::ScriptedEngine;
use procpool::{
    EventBus, LaunchSpec, Pool, PoolConfig, PoolEvent, RequestId, RetirementReason, WorkerId,
};
use tokio::sync::broadcast::Receiver;

const WAIT: Duration = Duration::from_secs(1);

fn pool_with_events(config: PoolConfig) -> (Pool<ScriptedEngine>, Receiver<PoolEvent>) {
    procpool_log::init_test();
    let bus = EventBus::default();
    let events = bus.subscribe();
    let pool = Pool::builder(ScriptedEngine::new(), LaunchSpec::new("scripted-worker"))
        .config(config)
        .diagnostics(bus)
        .prewarm_sleeper(|_| {})
        .build()
        .expect("valid pool config");
    (pool, events)
}

fn config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        ..PoolConfig::default()
    }
}

/// Everything emitted so far, optionally without metric snapshots.
fn received(events: &mut Receiver<PoolEvent>, keep_metrics: bool) -> Vec<PoolEvent> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| keep_metrics || !matches!(event, PoolEvent::MetricsUpdated(_)))
        .collect()
}

/// Collect events until `done` matches one or `within` elapses.
fn collect_until(
    events: &mut Receiver<PoolEvent>,
    within: Duration,
    done: impl Fn(&PoolEvent) -> bool,
) -> Vec<PoolEvent> {
    let deadline = Instant::now() + within;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(PoolEvent::MetricsUpdated(_)) => {}
            Ok(event) => {
                let finished = done(&event);
                seen.push(event);
                if finished {
                    break;
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    seen
}

#[test]
fn lease_and_drain_emit_events_in_order() {
    let (pool, mut events) = pool_with_events(config(1));

    let lease = pool.acquire_timeout(WAIT).unwrap();
    let request_id = lease.request_id();
    lease.close();
    assert!(pool.drain(WAIT));

    let worker_id = WorkerId::new(1);
    assert_eq!(
        received(&mut events, false),
        vec![
            PoolEvent::WorkerCreated { worker_id },
            PoolEvent::LeaseAcquired {
                worker_id,
                request_id,
                reuse_count: 0,
            },
            PoolEvent::LeaseReleased {
                worker_id,
                request_id,
            },
            PoolEvent::Draining,
            PoolEvent::WorkerRetired {
                worker_id,
                reason: RetirementReason::Drain,
            },
            PoolEvent::Terminated,
        ]
    );
}

#[test]
fn terminated_is_emitted_once_across_repeated_drains() {
    let (pool, mut events) = pool_with_events(config(1));
    assert!(pool.drain(WAIT));
    assert!(pool.drain(Duration::ZERO));

    let terminal: Vec<_> = received(&mut events, false)
        .into_iter()
        .filter(|event| matches!(event, PoolEvent::Draining | PoolEvent::Terminated))
        .collect();
    assert_eq!(terminal, vec![PoolEvent::Draining, PoolEvent::Terminated]);
}

#[test]
fn consecutive_metric_snapshots_always_differ() {
    let (pool, mut events) = pool_with_events(config(2));

    for _ in 0..3 {
        let first = pool.acquire_timeout(WAIT).unwrap();
        let second = pool.acquire_timeout(WAIT).unwrap();
        first.close();
        second.close();
    }
    pool.drain(WAIT);

    let snapshots: Vec<_> = received(&mut events, true)
        .into_iter()
        .filter_map(|event| match event {
            PoolEvent::MetricsUpdated(metrics) => Some(metrics),
            _ => None,
        })
        .collect();
    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    assert_eq!(snapshots.last().map(|m| m.total_workers), Some(0));
}

#[test]
fn request_timeout_reports_failure_before_retirement() {
    let (pool, mut events) = pool_with_events(PoolConfig {
        request_timeout: Duration::from_millis(30),
        ..config(1)
    });

    let lease = pool.acquire_timeout(WAIT).unwrap();
    let request_id: RequestId = lease.request_id();
    let worker_id = lease.worker_id();

    let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
        matches!(event, PoolEvent::WorkerRetired { .. })
    });
    drop(lease);

    let timed_out = seen
        .iter()
        .position(|e| *e == PoolEvent::LeaseTimedOut { worker_id, request_id })
        .expect("timeout event");
    let failed = seen
        .iter()
        .position(|e| {
            matches!(e, PoolEvent::WorkerFailed { error, .. } if error.contains("exceeded request timeout"))
        })
        .expect("failure event");
    let retired = seen
        .iter()
        .position(|e| {
            *e == PoolEvent::WorkerRetired {
                worker_id,
                reason: RetirementReason::RequestTimeout,
            }
        })
        .expect("retirement event");
    assert!(timed_out < failed && failed < retired);
}

#[test]
fn rejected_acquisition_is_reported() {
    let (pool, mut events) = pool_with_events(PoolConfig {
        max_queue_depth: 0,
        ..config(1)
    });
    let _held = pool.acquire_timeout(WAIT).unwrap();

    assert!(pool.acquire_timeout(WAIT).is_err());
    assert!(received(&mut events, false).contains(&PoolEvent::QueueRejected {
        pending: 0,
        capacity: 0,
    }));
}

#[tokio::test]
async fn subscribers_receive_events_asynchronously() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let pool = Pool::builder(ScriptedEngine::new(), LaunchSpec::new("scripted-worker"))
        .config(config(1))
        .diagnostics(bus)
        .build()
        .unwrap();

    let lease = pool.acquire_timeout(WAIT).unwrap();
    let worker_id = lease.worker_id();
    drop(lease);

    loop {
        match events.recv().await.unwrap() {
            PoolEvent::WorkerCreated { worker_id: created } => {
                assert_eq!(created, worker_id);
                break;
            }
            _ => continue,
        }
    }
}
