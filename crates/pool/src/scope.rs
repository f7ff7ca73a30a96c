//! Identifiers and per-lease metadata.

use std::fmt;
use std::time::Instant;

use uuid::Uuid;

/// Stable identifier of a pooled worker. Assigned in increasing order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a single lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Snapshot taken when a lease starts.
///
/// Used to correlate request deadlines, diagnostics and reset hooks with the
/// lease that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseScope {
    request_id: RequestId,
    worker_id: WorkerId,
    lease_start: Instant,
    worker_created_at: Instant,
    reuse_count: u64,
}

impl LeaseScope {
    pub(crate) fn new(
        worker_id: WorkerId,
        lease_start: Instant,
        worker_created_at: Instant,
        reuse_count: u64,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            worker_id,
            lease_start,
            worker_created_at,
            reuse_count,
        }
    }

    /// Identifier unique to this lease.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Worker backing the lease.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// When the lease was granted.
    pub fn lease_start(&self) -> Instant {
        self.lease_start
    }

    /// When the worker was launched.
    pub fn worker_created_at(&self) -> Instant {
        self.worker_created_at
    }

    /// Number of leases the worker completed before this one.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }
}
