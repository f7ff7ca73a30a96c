//! Event broadcasting for pool observability.
//!
//! [`EventBus`] implements [`PoolDiagnostics`] and republishes every callback
//! as a [`PoolEvent`] over `tokio::sync::broadcast`, so async code can follow
//! pool activity without implementing a listener.

use std::error::Error as StdError;

use tokio::sync::broadcast;

use crate::diagnostics::PoolDiagnostics;
use crate::metrics::PoolMetrics;
use crate::retirement::RetirementReason;
use crate::scope::{LeaseScope, RequestId, WorkerId};

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted by a pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    WorkerCreated {
        worker_id: WorkerId,
    },
    WorkerRetired {
        worker_id: WorkerId,
        reason: RetirementReason,
    },
    WorkerFailed {
        worker_id: WorkerId,
        /// Rendered error message.
        error: String,
    },
    LeaseAcquired {
        worker_id: WorkerId,
        request_id: RequestId,
        reuse_count: u64,
    },
    LeaseReleased {
        worker_id: WorkerId,
        request_id: RequestId,
    },
    LeaseTimedOut {
        worker_id: WorkerId,
        request_id: RequestId,
    },
    QueueRejected {
        pending: usize,
        capacity: usize,
    },
    MetricsUpdated(PoolMetrics),
    Draining,
    Terminated,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus.
///
/// Emission is fire-and-forget: with no subscribers, or a full channel, events
/// are dropped and the pool never blocks on a slow subscriber.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `buffer_size` events per subscriber.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    pub fn emit(&self, event: PoolEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Receive every event emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

impl PoolDiagnostics for EventBus {
    fn worker_created(&self, worker_id: WorkerId) {
        self.emit(PoolEvent::WorkerCreated { worker_id });
    }

    fn worker_retired(&self, worker_id: WorkerId, reason: RetirementReason) {
        self.emit(PoolEvent::WorkerRetired { worker_id, reason });
    }

    fn worker_failed(&self, worker_id: WorkerId, error: &(dyn StdError + 'static)) {
        self.emit(PoolEvent::WorkerFailed {
            worker_id,
            error: error.to_string(),
        });
    }

    fn lease_acquired(&self, scope: &LeaseScope) {
        self.emit(PoolEvent::LeaseAcquired {
            worker_id: scope.worker_id(),
            request_id: scope.request_id(),
            reuse_count: scope.reuse_count(),
        });
    }

    fn lease_released(&self, scope: &LeaseScope) {
        self.emit(PoolEvent::LeaseReleased {
            worker_id: scope.worker_id(),
            request_id: scope.request_id(),
        });
    }

    fn lease_timed_out(&self, scope: &LeaseScope) {
        self.emit(PoolEvent::LeaseTimedOut {
            worker_id: scope.worker_id(),
            request_id: scope.request_id(),
        });
    }

    fn queue_rejected(&self, pending: usize, capacity: usize) {
        self.emit(PoolEvent::QueueRejected { pending, capacity });
    }

    fn metrics_updated(&self, metrics: &PoolMetrics) {
        self.emit(PoolEvent::MetricsUpdated(*metrics));
    }

    fn pool_draining(&self) {
        self.emit(PoolEvent::Draining);
    }

    fn pool_terminated(&self) {
        self.emit(PoolEvent::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_creates_bus_with_1024_buffer() {
        let bus = EventBus::default();
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.pool_draining();
        bus.worker_created(WorkerId::new(1));
    }

    #[test]
    fn diagnostics_callbacks_become_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.worker_retired(WorkerId::new(2), RetirementReason::IdleTimeout);
        bus.queue_rejected(4, 4);

        let first = tokio_test::block_on(rx.recv()).expect("should receive event");
        assert_eq!(
            first,
            PoolEvent::WorkerRetired {
                worker_id: WorkerId::new(2),
                reason: RetirementReason::IdleTimeout,
            }
        );
        let second = tokio_test::block_on(rx.recv()).expect("should receive event");
        assert_eq!(
            second,
            PoolEvent::QueueRejected {
                pending: 4,
                capacity: 4
            }
        );
    }

    #[tokio::test]
    async fn worker_failure_carries_rendered_error() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let error = std::io::Error::other("exit status 3");
        bus.worker_failed(WorkerId::new(9), &error);

        match rx.recv().await.expect("should receive event") {
            PoolEvent::WorkerFailed { worker_id, error } => {
                assert_eq!(worker_id, WorkerId::new(9));
                assert_eq!(error, "exit status 3");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
