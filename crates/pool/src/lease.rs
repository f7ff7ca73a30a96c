//! RAII lease over a pooled worker.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::engine::ProcessEngine;
use crate::hooks::ResetRequest;
use crate::pool::PoolCore;
use crate::scope::{LeaseScope, RequestId, WorkerId};
use crate::worker::PoolWorker;

/// Exclusive use of one worker until closed or dropped.
///
/// Dereferences to the engine's session. Closing is idempotent: the first
/// [`close`](Self::close) (or the drop) returns the worker, later calls do
/// nothing.
pub struct Lease<E: ProcessEngine> {
    core: Arc<PoolCore<E>>,
    worker: Arc<PoolWorker<E::Session>>,
    scope: LeaseScope,
    closed: AtomicBool,
}

impl<E: ProcessEngine> Lease<E> {
    pub(crate) fn new(
        core: Arc<PoolCore<E>>,
        worker: Arc<PoolWorker<E::Session>>,
        scope: LeaseScope,
    ) -> Self {
        core.active_leases.register(scope);
        Self {
            core,
            worker,
            scope,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &E::Session {
        self.worker.session()
    }

    pub fn scope(&self) -> &LeaseScope {
        &self.scope
    }

    pub fn worker_id(&self) -> WorkerId {
        self.scope.worker_id()
    }

    pub fn request_id(&self) -> RequestId {
        self.scope.request_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run reset hooks now, without ending the lease. A retire decision marks
    /// the worker so that closing the lease retires it.
    pub fn reset(&self, request: ResetRequest) {
        if self.is_closed() {
            return;
        }
        self.core.reset_lease(&self.worker, &self.scope, request);
    }

    /// Return the worker to the pool.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.core.release_lease(&self.worker, &self.scope);
    }
}

impl<E: ProcessEngine> Deref for Lease<E> {
    type Target = E::Session;

    fn deref(&self) -> &E::Session {
        self.worker.session()
    }
}

impl<E: ProcessEngine> Drop for Lease<E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: ProcessEngine> fmt::Debug for Lease<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("worker_id", &self.scope.worker_id())
            .field("request_id", &self.scope.request_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActiveLeaseRegistry
// ---------------------------------------------------------------------------

/// Scope of every live lease, keyed by worker id.
#[derive(Debug, Default)]
pub(crate) struct ActiveLeaseRegistry {
    leases: DashMap<WorkerId, LeaseScope>,
}

impl ActiveLeaseRegistry {
    pub(crate) fn register(&self, scope: LeaseScope) {
        self.leases.insert(scope.worker_id(), scope);
    }

    /// Remove the entry for `worker_id` if it still belongs to `request_id`.
    pub(crate) fn remove(&self, worker_id: WorkerId, request_id: RequestId) -> Option<LeaseScope> {
        self.leases
            .remove_if(&worker_id, |_, scope| scope.request_id() == request_id)
            .map(|(_, scope)| scope)
    }

    pub(crate) fn len(&self) -> usize {
        self.leases.len()
    }
}
