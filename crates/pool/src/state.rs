//! Lock-serialized pool state machine.
//!
//! Every public method takes the single pool lock, mutates the ledger, waiter
//! queue and lifecycle gate, and returns a value describing what the caller
//! must do once the lock is released: launch a process, close a session, or
//! surface an error. Nothing here touches a session.
//!
//! The lock is released with [`MutexGuard::unlock_fair`], so a thread that
//! has been waiting for it is handed ownership before the releasing thread
//! can barge back in.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::clock::SharedClock;
use crate::config::PoolConfig;
use crate::deadline::{AwaitResult, Deadline, await_while};
use crate::error::Error;
use crate::ledger::{CapacityLedger, RetiredWorker};
use crate::lifecycle::{DrainOutcome, LifecycleGate};
use crate::metrics::PoolMetrics;
use crate::retirement::{RetirementPolicy, RetirementReason};
use crate::scope::{LeaseScope, RequestId, WorkerId};
use crate::waiter::{Interrupt, WaitOutcome, WaiterQueue};
use crate::worker::PoolWorker;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to an acquisition attempt.
pub enum AcquireStatus<S> {
    /// A worker was leased to the caller.
    Leased {
        worker: Arc<PoolWorker<S>>,
        scope: LeaseScope,
    },
    /// A launch slot was reserved; the caller must launch outside the lock and
    /// report back through [`PoolState::on_launch_success`] or
    /// [`PoolState::on_launch_failure`].
    LaunchReserved(WorkerId),
    /// The waiter queue is full.
    QueueRejected { pending: usize, capacity: usize },
    Failed(Error),
}

/// Acquisition result plus every worker retired while the lock was held.
pub struct AcquireOutcome<S> {
    pub status: AcquireStatus<S>,
    pub retired: Vec<RetiredWorker<S>>,
}

/// Parameters of a single acquisition pass.
#[derive(Debug, Clone, Copy)]
pub struct AcquireRequest<'a> {
    pub deadline: Deadline,
    /// When false, fail with [`Error::NoWorkers`] instead of launching or queueing.
    pub wait_allowed: bool,
    pub preferred: Option<WorkerId>,
    pub interrupt: Option<&'a Interrupt>,
    /// Start of the caller's acquisition, used to report time waited.
    pub started: Instant,
}

/// Why a freshly launched worker was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchDiscardReason {
    PoolClosing,
    PoolTerminated,
}

impl LaunchDiscardReason {
    pub fn retirement_reason(self) -> RetirementReason {
        match self {
            Self::PoolClosing => RetirementReason::PoolClosing,
            Self::PoolTerminated => RetirementReason::PoolTerminated,
        }
    }
}

impl fmt::Display for LaunchDiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PoolClosing => "Process pool is shutting down",
            Self::PoolTerminated => "Process pool has been terminated",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Placed in the idle queue.
    Queued,
    /// Handed straight to the head waiter.
    Assigned,
    /// Pool is shutting down; the caller must retire the worker.
    Discarded(LaunchDiscardReason),
}

/// First half of a release, decided before reset hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePlan {
    /// The lease was already returned.
    Ignore,
    /// Run reset hooks, then try to keep the worker.
    Keep,
    Retire(RetirementReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    ReturnedToIdle,
    Assigned,
    /// Removed from inventory; the caller must close the session.
    Retired(RetirementReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainStatus {
    pub completed: bool,
    pub terminated_now: bool,
}

// ---------------------------------------------------------------------------
// PoolState
// ---------------------------------------------------------------------------

struct Inner<S> {
    ledger: CapacityLedger<S>,
    lifecycle: LifecycleGate,
    waiters: WaiterQueue<Arc<PoolWorker<S>>>,
}

pub struct PoolState<S> {
    inner: Arc<Mutex<Inner<S>>>,
    clock: SharedClock,
    queue_capacity: usize,
    invariant_checks: bool,
}

impl<S: Send + Sync + 'static> PoolState<S> {
    pub fn new(config: &PoolConfig, clock: SharedClock) -> Self {
        let policy = RetirementPolicy::new(config);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ledger: CapacityLedger::new(config, policy),
                lifecycle: LifecycleGate::new(),
                waiters: WaiterQueue::new(),
            })),
            clock,
            queue_capacity: config.max_queue_depth,
            invariant_checks: config.invariant_checks_enabled,
        }
    }

    /// Try to lease a worker, reserve a launch, or queue until one is assigned.
    pub fn acquire(&self, request: &AcquireRequest<'_>) -> AcquireOutcome<S> {
        let mut retired = Vec::new();
        let mut guard = self.inner.lock();
        let status = loop {
            if let Some(error) = lifecycle_failure(&guard.lifecycle) {
                break AcquireStatus::Failed(error);
            }

            let now = self.clock.now();
            if let Some(preferred) = request.preferred
                && guard.waiters.is_empty()
                && let Some(worker) = guard.ledger.take_idle(preferred, &mut retired, now)
            {
                let scope = guard.ledger.begin_lease(&worker, now);
                break AcquireStatus::Leased { worker, scope };
            }

            if let Some(worker) = guard.ledger.poll_idle(&mut retired, now) {
                if guard.waiters.is_empty() {
                    let scope = guard.ledger.begin_lease(&worker, now);
                    break AcquireStatus::Leased { worker, scope };
                }
                // Waiters queued earlier are served first.
                if let Err(worker) = guard.waiters.assign_to_next(worker) {
                    guard.ledger.enqueue_returned_idle(worker);
                }
                continue;
            }

            if !request.wait_allowed {
                break AcquireStatus::Failed(Error::NoWorkers);
            }

            // Slots freed for woken waiters are theirs to reserve.
            if guard.ledger.spare_capacity() > guard.waiters.retrying()
                && let Some(worker_id) = guard.ledger.reserve_launch_worker_id()
            {
                break AcquireStatus::LaunchReserved(worker_id);
            }

            let pending = guard.waiters.len();
            if self.queue_capacity != usize::MAX && pending >= self.queue_capacity {
                break AcquireStatus::QueueRejected {
                    pending,
                    capacity: self.queue_capacity,
                };
            }

            match self.wait_for_assignment(&mut guard, request) {
                WaitOutcome::Assigned(worker) => {
                    let scope = guard.ledger.begin_lease(&worker, self.clock.now());
                    break AcquireStatus::Leased { worker, scope };
                }
                WaitOutcome::TimedOut => {
                    break AcquireStatus::Failed(Error::AcquireTimeout {
                        waited: request.started.elapsed(),
                    });
                }
                WaitOutcome::Interrupted(reclaimed) => {
                    if let Some(worker) = reclaimed {
                        route_to_waiter_or_idle(&mut guard, worker);
                    }
                    break AcquireStatus::Failed(Error::Interrupted);
                }
                // Closing cancelled the queue and the lifecycle check reports
                // it, or a launch slot freed up while queued.
                WaitOutcome::Cancelled | WaitOutcome::Retry => {}
            }
        };
        self.finish(guard, AcquireOutcome { status, retired })
    }

    fn wait_for_assignment(
        &self,
        guard: &mut MutexGuard<'_, Inner<S>>,
        request: &AcquireRequest<'_>,
    ) -> WaitOutcome<Arc<PoolWorker<S>>> {
        let ticket = guard.waiters.enqueue();

        if let Some(interrupt) = request.interrupt {
            let state: Weak<Mutex<Inner<S>>> = Arc::downgrade(&self.inner);
            let id = ticket.id;
            let registered = interrupt.register(Box::new(move || {
                if let Some(state) = state.upgrade() {
                    state.lock().waiters.interrupt(id);
                }
            }));
            if !registered {
                guard.waiters.interrupt(id);
            }
        }

        let result = await_while(guard, &ticket.wake, request.deadline, |inner| {
            inner.waiters.is_pending(ticket.id)
        });

        if let Some(interrupt) = request.interrupt {
            interrupt.clear();
        }
        guard
            .waiters
            .settle(ticket.id, result == AwaitResult::TimedOut)
    }

    /// Admit a worker launched for a reservation.
    pub fn on_launch_success(&self, worker: Arc<PoolWorker<S>>) -> LaunchOutcome {
        let mut guard = self.inner.lock();
        let outcome = if guard.lifecycle.is_terminated() {
            guard.ledger.discard_launch_reservation(false);
            LaunchOutcome::Discarded(LaunchDiscardReason::PoolTerminated)
        } else if guard.lifecycle.is_closing() {
            guard.ledger.discard_launch_reservation(false);
            LaunchOutcome::Discarded(LaunchDiscardReason::PoolClosing)
        } else {
            guard.ledger.register_launch();
            match guard.waiters.assign_to_next(worker) {
                Ok(()) => LaunchOutcome::Assigned,
                Err(worker) => {
                    guard.ledger.enqueue_returned_idle(worker);
                    LaunchOutcome::Queued
                }
            }
        };
        self.finish(guard, outcome)
    }

    /// Release a reservation whose launch failed.
    pub fn on_launch_failure(&self, count_failure: bool) {
        let mut guard = self.inner.lock();
        guard.ledger.discard_launch_reservation(count_failure);
        self.finish(guard, ());
    }

    /// Return the lease identified by `request_id` and decide whether reset
    /// hooks should run. `flag` marks the worker for retirement once the
    /// return is confirmed. A stale request id leaves the worker untouched.
    pub fn begin_release(
        &self,
        worker: &PoolWorker<S>,
        request_id: RequestId,
        now: Instant,
        flag: Option<RetirementReason>,
    ) -> ReleasePlan {
        let mut guard = self.inner.lock();
        let returned = guard.ledger.return_lease(worker, request_id, now);
        let plan = if !returned.processed {
            ReleasePlan::Ignore
        } else {
            if let Some(reason) = flag {
                worker.request_retire(reason);
            }
            if returned.drain_signal_needed {
                guard.lifecycle.signal_state_change();
            }
            if guard.lifecycle.is_closing() {
                ReleasePlan::Retire(RetirementReason::PoolClosing)
            } else {
                ReleasePlan::Keep
            }
        };
        self.finish(guard, plan)
    }

    /// Finish a release: retire, hand to the next waiter, or park as idle.
    pub fn complete_release(
        &self,
        worker: &Arc<PoolWorker<S>>,
        now: Instant,
        plan: ReleasePlan,
    ) -> ReleaseOutcome {
        let mut guard = self.inner.lock();
        let retirement = match plan {
            ReleasePlan::Ignore => None,
            ReleasePlan::Retire(reason) => Some(reason),
            ReleasePlan::Keep => worker
                .retirement_reason()
                .or_else(|| guard.ledger.retirement_threshold_reason(worker, now)),
        };
        let outcome = match (plan, retirement) {
            (ReleasePlan::Ignore, _) => ReleaseOutcome::ReturnedToIdle,
            (_, Some(reason)) => {
                worker.request_retire(reason);
                guard.ledger.retire_returned_worker();
                ReleaseOutcome::Retired(reason)
            }
            (_, None) => match guard.waiters.assign_to_next(Arc::clone(worker)) {
                Ok(()) => ReleaseOutcome::Assigned,
                Err(worker) => {
                    guard.ledger.enqueue_returned_idle(worker);
                    ReleaseOutcome::ReturnedToIdle
                }
            },
        };
        self.finish(guard, outcome)
    }

    /// Flag a leased worker for retirement on release, provided it is still
    /// leased to `request_id`. Returns whether the flag was applied.
    pub fn flag_retirement(
        &self,
        worker: &PoolWorker<S>,
        request_id: RequestId,
        reason: RetirementReason,
    ) -> bool {
        let guard = self.inner.lock();
        let leased = worker.active_request() == Some(request_id);
        if leased {
            worker.request_retire(reason);
        }
        self.finish(guard, leased)
    }

    /// Reserve one launch slot while the pool is below `min_size`.
    pub fn reserve_next_for_minimum(&self) -> Option<WorkerId> {
        let mut guard = self.inner.lock();
        let reservation = if guard.lifecycle.is_closing() {
            None
        } else {
            guard.ledger.reserve_next_for_minimum()
        };
        self.finish(guard, reservation)
    }

    pub fn snapshot(&self) -> PoolMetrics {
        let guard = self.inner.lock();
        let metrics = guard.ledger.snapshot(guard.waiters.len());
        self.finish(guard, metrics)
    }

    /// Enter the closing state and wake every waiter. `true` if this call did it.
    pub fn mark_closing(&self) -> bool {
        let mut guard = self.inner.lock();
        let transitioned = guard.lifecycle.mark_closing();
        if transitioned {
            guard.waiters.cancel_all();
        }
        self.finish(guard, transitioned)
    }

    /// Wait for active leases to finish, then move every idle worker into
    /// `retiring`. Launch reservations still in flight are not waited for.
    pub fn drain(&self, deadline: Deadline, retiring: &mut Vec<Arc<PoolWorker<S>>>) -> DrainStatus {
        let mut guard = self.inner.lock();
        let outcome = LifecycleGate::await_drain(
            &mut guard,
            deadline,
            |inner| &mut inner.lifecycle,
            |inner| inner.ledger.has_active_workers(),
        );
        let status = match outcome {
            DrainOutcome::Completed { terminated_now } => {
                guard.ledger.drain_idle_workers(retiring);
                DrainStatus {
                    completed: true,
                    terminated_now,
                }
            }
            DrainOutcome::TimedOut => DrainStatus {
                completed: false,
                terminated_now: false,
            },
        };
        self.finish(guard, status)
    }

    pub fn record_retirement(&self) {
        let mut guard = self.inner.lock();
        guard.ledger.record_retirement();
        self.finish(guard, ());
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().lifecycle.is_closing()
    }

    /// Wake one waiter per free launch slot, then unlock fairly.
    fn finish<T>(&self, mut guard: MutexGuard<'_, Inner<S>>, value: T) -> T {
        let spare = guard.ledger.spare_capacity();
        guard.waiters.retry_for_capacity(spare);
        if self.invariant_checks {
            assert_invariants(&guard);
        }
        MutexGuard::unlock_fair(guard);
        value
    }
}

impl<S> fmt::Debug for PoolState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("PoolState")
            .field("ledger", &guard.ledger)
            .field("waiters", &guard.waiters)
            .field("lifecycle", &guard.lifecycle)
            .finish()
    }
}

fn lifecycle_failure(lifecycle: &LifecycleGate) -> Option<Error> {
    if lifecycle.is_terminated() {
        Some(Error::Terminated)
    } else if lifecycle.is_closing() {
        Some(Error::Closing)
    } else {
        None
    }
}

fn route_to_waiter_or_idle<S>(inner: &mut Inner<S>, worker: Arc<PoolWorker<S>>) {
    if let Err(worker) = inner.waiters.assign_to_next(worker) {
        inner.ledger.enqueue_returned_idle(worker);
    }
}

fn assert_invariants<S>(inner: &Inner<S>) {
    let allocated = inner.ledger.allocated_workers();
    let active = inner.ledger.active_workers();
    let idle = inner.ledger.idle_workers();
    let launching = inner.ledger.launching_workers();
    let max_size = inner.ledger.max_size();
    let waiters = inner.waiters.len();
    let closing = inner.lifecycle.is_closing();
    let terminated = inner.lifecycle.is_terminated();

    assert!(
        allocated + launching <= max_size,
        "Total workers must not exceed max size (allocated={allocated}, launching={launching}, max={max_size})"
    );
    assert!(
        allocated >= active + idle,
        "Allocated workers cannot be less than active + idle (allocated={allocated}, active={active}, idle={idle})"
    );
    assert!(
        !closing || waiters == 0,
        "Closing pool must not retain waiter queue entries (waiters={waiters})"
    );
    assert!(
        !terminated || closing,
        "Terminated pool must have been closed (terminated={terminated}, closing={closing})"
    );
}
