//! Observer hooks for pool activity.
//!
//! Every callback has a no-op default, so a listener implements only what it
//! cares about. Callbacks are invoked outside the pool lock, on whichever
//! thread performed the operation.

use std::error::Error as StdError;
use std::sync::Arc;

use crate::metrics::PoolMetrics;
use crate::retirement::RetirementReason;
use crate::scope::{LeaseScope, WorkerId};

/// Shared handle to a diagnostics listener.
pub type SharedDiagnostics = Arc<dyn PoolDiagnostics>;

/// Listener for pool lifecycle, lease, and metrics events.
pub trait PoolDiagnostics: Send + Sync + 'static {
    fn worker_created(&self, _worker_id: WorkerId) {}

    fn worker_retired(&self, _worker_id: WorkerId, _reason: RetirementReason) {}

    /// A launch, warmup, reset hook, or request failed for a worker.
    fn worker_failed(&self, _worker_id: WorkerId, _error: &(dyn StdError + 'static)) {}

    fn lease_acquired(&self, _scope: &LeaseScope) {}

    fn lease_released(&self, _scope: &LeaseScope) {}

    fn lease_timed_out(&self, _scope: &LeaseScope) {}

    fn queue_rejected(&self, _pending: usize, _capacity: usize) {}

    /// Only called when the snapshot differs from the previous one.
    fn metrics_updated(&self, _metrics: &PoolMetrics) {}

    fn pool_draining(&self) {}

    fn pool_terminated(&self) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDiagnostics;

impl PoolDiagnostics for NoopDiagnostics {}

/// Listener that forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl PoolDiagnostics for TracingDiagnostics {
    fn worker_created(&self, worker_id: WorkerId) {
        tracing::debug!(worker_id = %worker_id, "worker created");
    }

    fn worker_retired(&self, worker_id: WorkerId, reason: RetirementReason) {
        tracing::debug!(worker_id = %worker_id, reason = %reason, "worker retired");
    }

    fn worker_failed(&self, worker_id: WorkerId, error: &(dyn StdError + 'static)) {
        tracing::warn!(worker_id = %worker_id, error = %error, "worker failed");
    }

    fn lease_acquired(&self, scope: &LeaseScope) {
        tracing::trace!(
            worker_id = %scope.worker_id(),
            request_id = %scope.request_id(),
            reuse_count = scope.reuse_count(),
            "lease acquired"
        );
    }

    fn lease_released(&self, scope: &LeaseScope) {
        tracing::trace!(
            worker_id = %scope.worker_id(),
            request_id = %scope.request_id(),
            held_ms = scope.lease_start().elapsed().as_millis() as u64,
            "lease released"
        );
    }

    fn lease_timed_out(&self, scope: &LeaseScope) {
        tracing::warn!(
            worker_id = %scope.worker_id(),
            request_id = %scope.request_id(),
            "lease exceeded request timeout"
        );
    }

    fn queue_rejected(&self, pending: usize, capacity: usize) {
        tracing::warn!(pending, capacity, "acquire rejected, waiter queue full");
    }

    fn metrics_updated(&self, metrics: &PoolMetrics) {
        tracing::trace!(
            total = metrics.total_workers,
            idle = metrics.idle_workers,
            active = metrics.active_workers,
            launching = metrics.launching_workers,
            waiters = metrics.pending_waiters,
            "pool metrics"
        );
    }

    fn pool_draining(&self) {
        tracing::info!("process pool draining");
    }

    fn pool_terminated(&self) {
        tracing::info!("process pool terminated");
    }
}

/// Forwards every event to each listener in order.
pub(crate) struct Fanout(pub(crate) Vec<SharedDiagnostics>);

impl PoolDiagnostics for Fanout {
    fn worker_created(&self, worker_id: WorkerId) {
        self.0.iter().for_each(|d| d.worker_created(worker_id));
    }

    fn worker_retired(&self, worker_id: WorkerId, reason: RetirementReason) {
        self.0.iter().for_each(|d| d.worker_retired(worker_id, reason));
    }

    fn worker_failed(&self, worker_id: WorkerId, error: &(dyn StdError + 'static)) {
        self.0.iter().for_each(|d| d.worker_failed(worker_id, error));
    }

    fn lease_acquired(&self, scope: &LeaseScope) {
        self.0.iter().for_each(|d| d.lease_acquired(scope));
    }

    fn lease_released(&self, scope: &LeaseScope) {
        self.0.iter().for_each(|d| d.lease_released(scope));
    }

    fn lease_timed_out(&self, scope: &LeaseScope) {
        self.0.iter().for_each(|d| d.lease_timed_out(scope));
    }

    fn queue_rejected(&self, pending: usize, capacity: usize) {
        self.0.iter().for_each(|d| d.queue_rejected(pending, capacity));
    }

    fn metrics_updated(&self, metrics: &PoolMetrics) {
        self.0.iter().for_each(|d| d.metrics_updated(metrics));
    }

    fn pool_draining(&self) {
        self.0.iter().for_each(|d| d.pool_draining());
    }

    fn pool_terminated(&self) {
        self.0.iter().for_each(|d| d.pool_terminated());
    }
}
