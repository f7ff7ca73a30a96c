//! Why workers leave circulation, and the thresholds that decide it.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::worker::PoolWorker;

/// Reason a worker was permanently removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetirementReason {
    PoolClosing,
    PoolTerminated,
    /// The lease holder asked for the worker to be retired.
    RetireRequested,
    /// A reset hook returned [`ResetOutcome::Retire`](crate::ResetOutcome::Retire).
    ResetHookRequested,
    /// A reset hook returned an error or panicked.
    ResetHookFailure,
    /// The lease overran the per-request timeout.
    RequestTimeout,
    IdleTimeout,
    ReuseLimitReached,
    LifetimeExceeded,
    Drain,
}

impl RetirementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolClosing => "pool_closing",
            Self::PoolTerminated => "pool_terminated",
            Self::RetireRequested => "retire_requested",
            Self::ResetHookRequested => "reset_hook_requested",
            Self::ResetHookFailure => "reset_hook_failure",
            Self::RequestTimeout => "request_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::ReuseLimitReached => "reuse_limit_reached",
            Self::LifetimeExceeded => "lifetime_exceeded",
            Self::Drain => "drain",
        }
    }
}

impl fmt::Display for RetirementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold evaluation. Pure: never mutates the worker.
///
/// A zero threshold disables the corresponding check.
#[derive(Debug, Clone, Copy)]
pub struct RetirementPolicy {
    max_requests_per_worker: u64,
    max_worker_lifetime: Duration,
    max_idle_time: Duration,
}

impl RetirementPolicy {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_requests_per_worker: config.max_requests_per_worker,
            max_worker_lifetime: config.max_worker_lifetime,
            max_idle_time: config.max_idle_time,
        }
    }

    /// Reuse-count and lifetime thresholds, checked when a lease is returned.
    pub fn should_retire<S>(&self, worker: &PoolWorker<S>, now: Instant) -> Option<RetirementReason> {
        if self.max_requests_per_worker > 0 && worker.reuse_count() >= self.max_requests_per_worker {
            return Some(RetirementReason::ReuseLimitReached);
        }
        if !self.max_worker_lifetime.is_zero()
            && now.saturating_duration_since(worker.created_at()) >= self.max_worker_lifetime
        {
            return Some(RetirementReason::LifetimeExceeded);
        }
        None
    }

    /// Idle-time threshold, checked when a worker is polled from the idle queue.
    pub fn should_retire_for_idle<S>(
        &self,
        worker: &PoolWorker<S>,
        now: Instant,
    ) -> Option<RetirementReason> {
        if !self.max_idle_time.is_zero()
            && now.saturating_duration_since(worker.last_used()) >= self.max_idle_time
        {
            return Some(RetirementReason::IdleTimeout);
        }
        None
    }
}
