//! Per-lease execution deadlines.
//!
//! Timers run on a private single-worker tokio runtime and never touch the
//! pool lock. When a timer fires, its callback runs on the runtime's
//! blocking pool, since the release it triggers may close a process.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::scope::{RequestId, WorkerId};

/// Shortest delay a timer is armed with.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Callback run when a request deadline elapses.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Timer service keyed by worker id. Only the newest timer per worker is live.
pub trait RequestTimeoutScheduler: Send + Sync + 'static {
    /// Arm a one-shot timer, replacing any timer already armed for `worker_id`.
    fn schedule(
        &self,
        worker_id: WorkerId,
        request_id: RequestId,
        timeout: Duration,
        on_timeout: TimeoutCallback,
    );

    /// Disarm whatever timer is armed for `worker_id`.
    fn cancel(&self, worker_id: WorkerId);

    /// Remove the timer only if it still belongs to `request_id`.
    /// Returns `true` when this call removed it.
    fn complete(&self, worker_id: WorkerId, request_id: RequestId) -> bool;

    /// Disarm everything and stop the timer thread. Idempotent.
    fn close(&self);
}

struct Timer {
    request_id: RequestId,
    task: AbortHandle,
}

/// Tokio-backed [`RequestTimeoutScheduler`].
pub struct DefaultRequestTimeoutScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    timers: Arc<DashMap<WorkerId, Timer>>,
    closed: AtomicBool,
}

impl DefaultRequestTimeoutScheduler {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(4)
            .thread_name("procpool-request-timeouts")
            .enable_time()
            .build()
            .map_err(|e| Error::Configuration {
                message: "failed to start request timeout runtime".to_string(),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            timers: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl RequestTimeoutScheduler for DefaultRequestTimeoutScheduler {
    fn schedule(
        &self,
        worker_id: WorkerId,
        request_id: RequestId,
        timeout: Duration,
        on_timeout: TimeoutCallback,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let delay = timeout.max(MIN_DELAY);

        // The entry guard is held until the timer is recorded, so a timer
        // that fires immediately still finds itself in the map.
        let entry = self.timers.entry(worker_id);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(on_timeout).await
                && e.is_panic()
            {
                tracing::error!(worker_id = %worker_id, "request timeout callback panicked");
            }
        });
        let timer = Timer {
            request_id,
            task: task.abort_handle(),
        };
        let previous = match entry {
            Entry::Occupied(mut occupied) => Some(occupied.insert(timer)),
            Entry::Vacant(vacant) => {
                vacant.insert(timer);
                None
            }
        };
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    fn cancel(&self, worker_id: WorkerId) {
        if let Some((_, timer)) = self.timers.remove(&worker_id) {
            timer.task.abort();
        }
    }

    fn complete(&self, worker_id: WorkerId, request_id: RequestId) -> bool {
        self.timers
            .remove_if(&worker_id, |_, timer| timer.request_id == request_id)
            .is_some()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timers.retain(|_, timer| {
            timer.task.abort();
            false
        });
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::debug!("request timeout scheduler closed");
    }
}

impl Drop for DefaultRequestTimeoutScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DefaultRequestTimeoutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultRequestTimeoutScheduler")
            .field("pending", &self.timers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
