//! A launched session plus the bookkeeping the pool keeps about it.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;

use crate::retirement::RetirementReason;
use crate::scope::{RequestId, WorkerId};

#[derive(Debug)]
struct Usage {
    last_used: Instant,
    reuse_count: u64,
    leased: bool,
    active_request: Option<RequestId>,
}

/// Pooled worker. Owned by the pool; leases only borrow it.
pub struct PoolWorker<S> {
    id: WorkerId,
    session: S,
    created_at: Instant,
    usage: Mutex<Usage>,
    retirement: OnceLock<RetirementReason>,
}

impl<S> PoolWorker<S> {
    pub(crate) fn new(id: WorkerId, session: S, created_at: Instant) -> Self {
        Self {
            id,
            session,
            created_at,
            usage: Mutex::new(Usage {
                last_used: created_at,
                reuse_count: 0,
                leased: false,
                active_request: None,
            }),
            retirement: OnceLock::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.usage.lock().last_used
    }

    /// Completed leases so far.
    pub fn reuse_count(&self) -> u64 {
        self.usage.lock().reuse_count
    }

    pub fn is_leased(&self) -> bool {
        self.usage.lock().leased
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.usage.lock().active_request
    }

    /// Flag the worker for retirement. The first reason recorded wins.
    ///
    /// Only set while the pool lock is held, so the flag cannot appear
    /// between a release decision and the idle enqueue.
    pub(crate) fn request_retire(&self, reason: RetirementReason) {
        let _ = self.retirement.set(reason);
    }

    pub fn retire_requested(&self) -> bool {
        self.retirement.get().is_some()
    }

    pub fn retirement_reason(&self) -> Option<RetirementReason> {
        self.retirement.get().copied()
    }

    /// Transition into the leased state.
    ///
    /// # Panics
    ///
    /// Panics if the worker is already leased; the ledger never hands out a
    /// worker twice, so this indicates corrupted pool state.
    pub(crate) fn mark_leased(&self, request_id: RequestId) {
        let mut usage = self.usage.lock();
        assert!(
            !usage.leased,
            "worker {} leased twice (active request {:?})",
            self.id, usage.active_request
        );
        usage.leased = true;
        usage.active_request = Some(request_id);
    }

    /// End the lease identified by `request_id`. Returns `false`, changing
    /// nothing, if the worker is not leased or is leased to another request.
    pub(crate) fn mark_returned(&self, request_id: RequestId, now: Instant) -> bool {
        let mut usage = self.usage.lock();
        if !usage.leased || usage.active_request != Some(request_id) {
            return false;
        }
        usage.leased = false;
        usage.active_request = None;
        usage.reuse_count += 1;
        usage.last_used = now;
        true
    }
}

impl<S> fmt::Debug for PoolWorker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.usage.lock();
        f.debug_struct("PoolWorker")
            .field("id", &self.id)
            .field("reuse_count", &usage.reuse_count)
            .field("leased", &usage.leased)
            .field("retirement", &self.retirement.get())
            .finish_non_exhaustive()
    }
}
