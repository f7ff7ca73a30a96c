//! Point-in-time view of pool utilisation and lifetime counters.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Immutable snapshot produced by [`Pool::snapshot`](crate::Pool::snapshot).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolMetrics {
    /// Launched workers that have not been retired (idle + active).
    pub total_workers: usize,
    pub idle_workers: usize,
    pub active_workers: usize,
    /// Reserved launch slots whose process is still starting.
    pub launching_workers: usize,
    pub pending_waiters: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Configured queue depth; `usize::MAX` when unbounded.
    pub queue_capacity: usize,
    pub total_leases_served: u64,
    pub failed_launch_attempts: u64,
    pub total_replenishments: u64,
    pub total_retirements: u64,
}

impl PoolMetrics {
    /// Fraction of `max_size` currently leased, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.active_workers as f64 / self.max_size as f64
    }

    /// Remaining launch headroom.
    pub fn available_capacity(&self) -> usize {
        self.max_size
            .saturating_sub(self.total_workers + self.launching_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_and_headroom() {
        let metrics = PoolMetrics {
            total_workers: 3,
            active_workers: 2,
            idle_workers: 1,
            launching_workers: 1,
            max_size: 8,
            ..PoolMetrics::default()
        };
        assert!((metrics.utilization() - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.available_capacity(), 4);
        assert_eq!(PoolMetrics::default().utilization(), 0.0);
    }
}
