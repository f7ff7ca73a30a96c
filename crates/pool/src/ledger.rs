//! Worker inventory: counts, the idle queue and cumulative counters.
//!
//! The ledger takes no locks of its own. It is only ever touched through
//! [`PoolState`](crate::state::PoolState) while the pool lock is held, and
//! keeps these invariants:
//!
//! - `allocated >= active + idle`
//! - `allocated + launching <= max_size`
//!
//! Counter underflow means the pool's bookkeeping is corrupt and panics.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::PoolConfig;
use crate::metrics::PoolMetrics;
use crate::retirement::{RetirementPolicy, RetirementReason};
use crate::scope::{LeaseScope, RequestId, WorkerId};
use crate::worker::PoolWorker;

/// Worker removed from inventory while the lock was held; the facade
/// closes its session after unlocking.
pub struct RetiredWorker<S> {
    pub worker: Arc<PoolWorker<S>>,
    pub reason: RetirementReason,
}

impl<S> fmt::Debug for RetiredWorker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetiredWorker")
            .field("worker", &self.worker.id())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Result of [`CapacityLedger::return_lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseReturn {
    /// The worker actually transitioned out of the leased state.
    pub processed: bool,
    /// No active leases remain; drain waiters should re-check.
    pub drain_signal_needed: bool,
}

pub struct CapacityLedger<S> {
    min_size: usize,
    max_size: usize,
    queue_capacity: usize,
    policy: RetirementPolicy,
    idle: VecDeque<Arc<PoolWorker<S>>>,
    allocated: usize,
    active: usize,
    launching: usize,
    next_worker_id: u64,
    total_leases_served: u64,
    failed_launches: u64,
    total_replenishments: u64,
    total_retirements: u64,
}

impl<S> CapacityLedger<S> {
    pub fn new(config: &PoolConfig, policy: RetirementPolicy) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            queue_capacity: config.max_queue_depth,
            policy,
            idle: VecDeque::new(),
            allocated: 0,
            active: 0,
            launching: 0,
            next_worker_id: 1,
            total_leases_served: 0,
            failed_launches: 0,
            total_replenishments: 0,
            total_retirements: 0,
        }
    }

    /// Next idle worker safe to lease. Workers flagged for retirement or past
    /// the idle threshold are moved into `retired` and the scan continues.
    pub fn poll_idle(
        &mut self,
        retired: &mut Vec<RetiredWorker<S>>,
        now: Instant,
    ) -> Option<Arc<PoolWorker<S>>> {
        while let Some(candidate) = self.idle.pop_front() {
            if let Some(reason) = self.idle_retirement(&candidate, now) {
                self.retire_idle(retired, candidate, reason);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Remove a specific worker from the idle queue, applying the same checks
    /// as [`poll_idle`](Self::poll_idle). `None` if the worker is not idle or
    /// had to be retired.
    pub fn take_idle(
        &mut self,
        id: WorkerId,
        retired: &mut Vec<RetiredWorker<S>>,
        now: Instant,
    ) -> Option<Arc<PoolWorker<S>>> {
        let position = self.idle.iter().position(|worker| worker.id() == id)?;
        let candidate = self.idle.remove(position)?;
        if let Some(reason) = self.idle_retirement(&candidate, now) {
            self.retire_idle(retired, candidate, reason);
            return None;
        }
        Some(candidate)
    }

    fn idle_retirement(&self, worker: &PoolWorker<S>, now: Instant) -> Option<RetirementReason> {
        worker
            .retirement_reason()
            .or_else(|| self.policy.should_retire_for_idle(worker, now))
    }

    fn retire_idle(
        &mut self,
        retired: &mut Vec<RetiredWorker<S>>,
        worker: Arc<PoolWorker<S>>,
        reason: RetirementReason,
    ) {
        assert!(
            self.allocated > 0,
            "allocated workers cannot underflow when retiring idle"
        );
        self.allocated -= 1;
        retired.push(RetiredWorker { worker, reason });
    }

    /// Move a worker into the active state and stamp a fresh scope.
    pub fn begin_lease(&mut self, worker: &PoolWorker<S>, lease_start: Instant) -> LeaseScope {
        let scope = LeaseScope::new(
            worker.id(),
            lease_start,
            worker.created_at(),
            worker.reuse_count(),
        );
        worker.mark_leased(scope.request_id());
        self.active += 1;
        self.total_leases_served += 1;
        scope
    }

    /// Record a finished lease. A second return of the same lease, or a return
    /// for a request the worker no longer serves, is a no-op.
    pub fn return_lease(
        &mut self,
        worker: &PoolWorker<S>,
        request_id: RequestId,
        now: Instant,
    ) -> LeaseReturn {
        if !worker.mark_returned(request_id, now) {
            return LeaseReturn {
                processed: false,
                drain_signal_needed: false,
            };
        }
        assert!(
            self.active > 0,
            "active workers cannot underflow when lease returns"
        );
        self.active -= 1;
        LeaseReturn {
            processed: true,
            drain_signal_needed: self.active == 0,
        }
    }

    /// Reuse and lifetime thresholds for a returning worker.
    pub fn retirement_threshold_reason(
        &self,
        worker: &PoolWorker<S>,
        now: Instant,
    ) -> Option<RetirementReason> {
        self.policy.should_retire(worker, now)
    }

    /// Drop a returned worker from the allocated set.
    pub fn retire_returned_worker(&mut self) {
        assert!(
            self.allocated > 0,
            "allocated workers cannot underflow when retiring returned worker"
        );
        self.allocated -= 1;
    }

    pub fn enqueue_returned_idle(&mut self, worker: Arc<PoolWorker<S>>) {
        assert!(
            !worker.retire_requested(),
            "cannot enqueue worker {} scheduled for retirement",
            worker.id()
        );
        self.idle.push_back(worker);
    }

    /// Launch slots not taken by allocated or launching workers.
    pub fn spare_capacity(&self) -> usize {
        self.max_size.saturating_sub(self.allocated + self.launching)
    }

    /// Reserve a launch slot if capacity allows.
    pub fn reserve_launch_worker_id(&mut self) -> Option<WorkerId> {
        if self.allocated + self.launching >= self.max_size {
            return None;
        }
        Some(self.reserve())
    }

    /// Reserve a launch slot only while the pool is below its minimum size.
    pub fn reserve_next_for_minimum(&mut self) -> Option<WorkerId> {
        let total = self.allocated + self.launching;
        if self.min_size == 0 || total >= self.min_size || total >= self.max_size {
            return None;
        }
        Some(self.reserve())
    }

    fn reserve(&mut self) -> WorkerId {
        self.launching += 1;
        let id = WorkerId::new(self.next_worker_id);
        self.next_worker_id += 1;
        id
    }

    pub fn discard_launch_reservation(&mut self, count_failure: bool) {
        assert!(
            self.launching > 0,
            "launching workers cannot underflow when discarding reservation"
        );
        self.launching -= 1;
        if count_failure {
            self.failed_launches += 1;
        }
    }

    /// Promote a reservation to an allocated worker.
    pub fn register_launch(&mut self) {
        assert!(
            self.launching > 0,
            "launching workers cannot underflow when registering launch"
        );
        self.launching -= 1;
        self.allocated += 1;
        self.total_replenishments += 1;
    }

    /// Empty the idle queue into `sink`, releasing each worker's allocation.
    pub fn drain_idle_workers(&mut self, sink: &mut Vec<Arc<PoolWorker<S>>>) {
        while let Some(worker) = self.idle.pop_front() {
            assert!(
                self.allocated > 0,
                "allocated workers cannot underflow when draining idle"
            );
            self.allocated -= 1;
            sink.push(worker);
        }
    }

    pub fn record_retirement(&mut self) {
        self.total_retirements += 1;
    }

    pub fn has_active_workers(&self) -> bool {
        self.active > 0
    }

    pub fn allocated_workers(&self) -> usize {
        self.allocated
    }

    pub fn active_workers(&self) -> usize {
        self.active
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    pub fn launching_workers(&self) -> usize {
        self.launching
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self, pending_waiters: usize) -> PoolMetrics {
        PoolMetrics {
            total_workers: self.allocated,
            idle_workers: self.idle.len(),
            active_workers: self.active,
            launching_workers: self.launching,
            pending_waiters,
            min_size: self.min_size,
            max_size: self.max_size,
            queue_capacity: self.queue_capacity,
            total_leases_served: self.total_leases_served,
            failed_launch_attempts: self.failed_launches,
            total_replenishments: self.total_replenishments,
            total_retirements: self.total_retirements,
        }
    }
}

impl<S> fmt::Debug for CapacityLedger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityLedger")
            .field("allocated", &self.allocated)
            .field("active", &self.active)
            .field("idle", &self.idle.len())
            .field("launching", &self.launching)
            .finish_non_exhaustive()
    }
}
