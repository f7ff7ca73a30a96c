//! Sizing and timing policy for a pool.
//!
//! Collaborators that cannot be serialized (warmup action, reset hooks,
//! diagnostics, clock) are supplied through [`PoolBuilder`](crate::PoolBuilder).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for the default `max_size`.
const DEFAULT_MAX_SIZE_CAP: usize = 8;

/// Configuration for a process pool
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_size: usize,
    /// Hard cap on launched plus launching workers
    pub max_size: usize,
    /// Maximum number of blocked acquirers; `usize::MAX` means unbounded
    pub max_queue_depth: usize,
    /// Leases a worker may serve before retirement; 0 disables the limit
    pub max_requests_per_worker: u64,
    /// Age after which a worker is retired on return; zero disables
    pub max_worker_lifetime: Duration,
    /// Idle time after which a worker is retired when polled; zero disables
    pub max_idle_time: Duration,
    /// Default wait used by [`Pool::acquire`](crate::Pool::acquire)
    pub lease_timeout: Duration,
    /// Per-lease execution deadline; zero disables
    pub request_timeout: Duration,
    /// Kill the whole process tree when a worker is retired
    pub destroy_process_tree: bool,
    /// Assert inventory invariants after every state transition
    pub invariant_checks_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_max_size(),
            max_queue_depth: usize::MAX,
            max_requests_per_worker: 1_000,
            max_worker_lifetime: Duration::from_secs(30 * 60),
            max_idle_time: Duration::from_secs(5 * 60),
            lease_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5 * 60),
            destroy_process_tree: true,
            invariant_checks_enabled: true,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be greater than 0"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Whether the waiter queue has a finite capacity.
    pub fn queue_is_bounded(&self) -> bool {
        self.max_queue_depth != usize::MAX
    }
}

/// Half the available cores, at least one, at most eight.
fn default_max_size() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    (cores / 2).clamp(1, DEFAULT_MAX_SIZE_CAP)
}
