//! Pool facade.
//!
//! [`Pool`] performs every side effect that [`PoolState`] must not perform
//! under its lock: launching and warming up sessions, running reset hooks,
//! closing retired sessions, arming request deadlines and publishing
//! diagnostics.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::PoolConfig;
use crate::deadline::Deadline;
use crate::diagnostics::{Fanout, NoopDiagnostics, PoolDiagnostics, SharedDiagnostics};
use crate::engine::{LaunchSpec, ProcessEngine, Session};
use crate::error::{Error, Result};
use crate::hooks::{
    CallbackPanicked, ResetHook, ResetHookRunner, ResetReason, ResetRequest, RetireDecision,
    WarmupAction,
};
use crate::lease::{ActiveLeaseRegistry, Lease};
use crate::metrics::PoolMetrics;
use crate::retirement::RetirementReason;
use crate::scope::{LeaseScope, RequestId, WorkerId};
use crate::state::{
    AcquireRequest, AcquireStatus, LaunchOutcome, PoolState, ReleaseOutcome, ReleasePlan,
};
use crate::timeout::{DefaultRequestTimeoutScheduler, RequestTimeoutScheduler};
use crate::waiter::Interrupt;
use crate::worker::PoolWorker;

const BASE_PREWARM_BACKOFF: Duration = Duration::from_millis(50);
const MAX_PREWARM_BACKOFF: Duration = Duration::from_millis(500);
const MAX_PREWARM_FAILURES: u32 = 10;

/// Sleep function used between failed pre-warm launches.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

// ---------------------------------------------------------------------------
// Acquire options
// ---------------------------------------------------------------------------

/// Worker affinity for an acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PreferredWorker {
    #[default]
    Any,
    /// Take this worker if it is idle and still fit for reuse.
    Specific(WorkerId),
}

impl PreferredWorker {
    fn worker_id(self) -> Option<WorkerId> {
        match self {
            Self::Any => None,
            Self::Specific(id) => Some(id),
        }
    }
}

/// Parameters for [`Pool::acquire_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions<'a> {
    /// `None` uses the configured lease timeout; zero performs a non-blocking probe.
    pub timeout: Option<Duration>,
    pub preferred: PreferredWorker,
    pub interrupt: Option<&'a Interrupt>,
}

impl<'a> AcquireOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prefer(mut self, worker_id: WorkerId) -> Self {
        self.preferred = PreferredWorker::Specific(worker_id);
        self
    }

    pub fn interrupt(mut self, interrupt: &'a Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

// ---------------------------------------------------------------------------
// PoolBuilder
// ---------------------------------------------------------------------------

/// Builder for [`Pool`].
pub struct PoolBuilder<E: ProcessEngine> {
    engine: E,
    launch_spec: LaunchSpec,
    config: PoolConfig,
    warmup: Option<Arc<dyn WarmupAction<E::Session>>>,
    reset_hooks: Vec<Arc<dyn ResetHook<E::Session>>>,
    diagnostics: Vec<SharedDiagnostics>,
    clock: SharedClock,
    scheduler: Option<Arc<dyn RequestTimeoutScheduler>>,
    sleeper: Sleeper,
}

impl<E: ProcessEngine> PoolBuilder<E> {
    pub fn new(engine: E, launch_spec: LaunchSpec) -> Self {
        Self {
            engine,
            launch_spec,
            config: PoolConfig::default(),
            warmup: None,
            reset_hooks: Vec::new(),
            diagnostics: Vec::new(),
            clock: Arc::new(SystemClock),
            scheduler: None,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn warmup(mut self, warmup: impl WarmupAction<E::Session> + 'static) -> Self {
        self.warmup = Some(Arc::new(warmup));
        self
    }

    /// Append a reset hook. Hooks run in the order they were added.
    pub fn reset_hook(mut self, hook: impl ResetHook<E::Session> + 'static) -> Self {
        self.reset_hooks.push(Arc::new(hook));
        self
    }

    /// Add a diagnostics listener. Several listeners are called in order.
    pub fn diagnostics(mut self, listener: impl PoolDiagnostics) -> Self {
        self.diagnostics.push(Arc::new(listener));
        self
    }

    pub fn shared_diagnostics(mut self, listener: SharedDiagnostics) -> Self {
        self.diagnostics.push(listener);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn timeout_scheduler(mut self, scheduler: Arc<dyn RequestTimeoutScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Replace the sleep used between failed pre-warm launches.
    pub fn prewarm_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate the configuration, start the pool and pre-warm `min_size` workers.
    pub fn build(self) -> Result<Pool<E>> {
        self.config.validate()?;
        self.launch_spec.validate()?;

        let diagnostics: SharedDiagnostics = match self.diagnostics.len() {
            0 => Arc::new(NoopDiagnostics),
            1 => self.diagnostics.into_iter().next().unwrap_or_else(|| Arc::new(NoopDiagnostics)),
            _ => Arc::new(Fanout(self.diagnostics)),
        };
        let scheduler: Arc<dyn RequestTimeoutScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(DefaultRequestTimeoutScheduler::new()?),
        };
        let launch_spec = self
            .launch_spec
            .destroy_process_tree(self.config.destroy_process_tree);

        let core = Arc::new(PoolCore {
            state: PoolState::new(&self.config, Arc::clone(&self.clock)),
            hooks: ResetHookRunner::new(self.reset_hooks, Arc::clone(&diagnostics)),
            engine: self.engine,
            launch_spec,
            warmup: self.warmup,
            diagnostics,
            clock: self.clock,
            scheduler,
            active_leases: ActiveLeaseRegistry::default(),
            last_published: Mutex::new(None),
            prewarm_failures: Mutex::new(0),
            sleeper: self.sleeper,
            config: self.config,
        });

        tracing::info!(
            min_size = core.config.min_size,
            max_size = core.config.max_size,
            program = ?core.launch_spec.program(),
            "process pool started"
        );
        core.ensure_minimum_size();
        core.publish_metrics();
        Ok(Pool { inner: core })
    }
}

impl<E: ProcessEngine + fmt::Debug> fmt::Debug for PoolBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("engine", &self.engine)
            .field("launch_spec", &self.launch_spec)
            .field("config", &self.config)
            .field("reset_hooks", &self.reset_hooks.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Pool of long-lived worker processes.
///
/// Cloning is cheap and every clone refers to the same pool. All methods are
/// thread-safe; blocking ones park the calling thread.
pub struct Pool<E: ProcessEngine> {
    inner: Arc<PoolCore<E>>,
}

impl<E: ProcessEngine> Clone for Pool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ProcessEngine> fmt::Debug for Pool<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("metrics", &self.inner.state.snapshot())
            .field("active_leases", &self.inner.active_leases.len())
            .finish()
    }
}

impl<E: ProcessEngine> Pool<E> {
    pub fn builder(engine: E, launch_spec: LaunchSpec) -> PoolBuilder<E> {
        PoolBuilder::new(engine, launch_spec)
    }

    /// Build a pool with no hooks and no diagnostics.
    pub fn new(engine: E, launch_spec: LaunchSpec, config: PoolConfig) -> Result<Self> {
        PoolBuilder::new(engine, launch_spec).config(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a worker, waiting up to the configured lease timeout.
    pub fn acquire(&self) -> Result<Lease<E>> {
        self.acquire_with(AcquireOptions::new())
    }

    /// Acquire a worker, waiting up to `timeout`. Zero never waits: it leases
    /// an idle worker or fails with [`Error::NoWorkers`].
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<E>> {
        self.acquire_with(AcquireOptions::new().timeout(timeout))
    }

    pub fn acquire_with(&self, options: AcquireOptions<'_>) -> Result<Lease<E>> {
        let core = &self.inner;
        let timeout = options.timeout.unwrap_or(core.config.lease_timeout);
        let request = AcquireRequest {
            deadline: Deadline::after(timeout),
            wait_allowed: !timeout.is_zero(),
            preferred: options.preferred.worker_id(),
            interrupt: options.interrupt,
            started: Instant::now(),
        };

        loop {
            let outcome = core.state.acquire(&request);
            core.publish_metrics();
            for retired in outcome.retired {
                core.retire_worker(&retired.worker, retired.reason);
            }
            core.ensure_minimum_size();

            match outcome.status {
                AcquireStatus::Leased { worker, scope } => {
                    let lease = Lease::new(Arc::clone(core), Arc::clone(&worker), scope);
                    core.start_request_deadline(&worker, &scope);
                    core.diagnostics.lease_acquired(&scope);
                    tracing::debug!(
                        worker_id = %scope.worker_id(),
                        request_id = %scope.request_id(),
                        reuse_count = scope.reuse_count(),
                        "worker leased"
                    );
                    return Ok(lease);
                }
                AcquireStatus::LaunchReserved(worker_id) => {
                    let worker = match core.launch_worker(worker_id) {
                        Ok(worker) => Arc::new(worker),
                        Err(error) => {
                            core.prewarm_backoff();
                            return Err(error);
                        }
                    };
                    let launched = core.state.on_launch_success(Arc::clone(&worker));
                    core.publish_metrics();
                    if let LaunchOutcome::Discarded(reason) = launched {
                        core.retire_worker(&worker, reason.retirement_reason());
                        core.ensure_minimum_size();
                        return Err(Error::LaunchDiscarded { worker_id, reason });
                    }
                    core.diagnostics.worker_created(worker_id);
                    core.publish_metrics();
                }
                AcquireStatus::QueueRejected { pending, capacity } => {
                    core.diagnostics.queue_rejected(pending, capacity);
                    return Err(Error::QueueFull { pending, capacity });
                }
                AcquireStatus::Failed(error) => return Err(error),
            }
        }
    }

    pub fn snapshot(&self) -> PoolMetrics {
        self.inner.state.snapshot()
    }

    /// Stop granting leases and fail every queued acquirer. Active leases stay
    /// valid until closed or timed out. Idempotent.
    pub fn close(&self) {
        let core = &self.inner;
        if core.state.mark_closing() {
            tracing::info!("process pool closing");
            core.diagnostics.pool_draining();
            core.publish_metrics();
        }
    }

    /// Close the pool, wait up to `timeout` for active leases to finish and
    /// retire every idle worker. Zero checks once without waiting.
    ///
    /// Returns `true` when the pool is fully drained and terminated.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.close();
        let core = &self.inner;
        let deadline = if timeout.is_zero() {
            Deadline::immediate()
        } else {
            Deadline::after(timeout)
        };

        let mut retiring = Vec::new();
        let status = core.state.drain(deadline, &mut retiring);
        core.publish_metrics();
        for worker in &retiring {
            core.retire_worker(worker, RetirementReason::Drain);
        }

        if status.completed && status.terminated_now {
            tracing::info!("process pool terminated");
            core.diagnostics.pool_terminated();
        }
        if status.completed {
            core.scheduler.close();
        } else {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "drain timed out");
        }
        status.completed
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.is_closing()
    }
}

// ---------------------------------------------------------------------------
// PoolCore
// ---------------------------------------------------------------------------

pub(crate) struct PoolCore<E: ProcessEngine> {
    config: PoolConfig,
    engine: E,
    launch_spec: LaunchSpec,
    state: PoolState<E::Session>,
    clock: SharedClock,
    warmup: Option<Arc<dyn WarmupAction<E::Session>>>,
    hooks: ResetHookRunner<E::Session>,
    diagnostics: SharedDiagnostics,
    scheduler: Arc<dyn RequestTimeoutScheduler>,
    pub(crate) active_leases: ActiveLeaseRegistry,
    last_published: Mutex<Option<PoolMetrics>>,
    prewarm_failures: Mutex<u32>,
    sleeper: Sleeper,
}

enum Prewarm {
    Created,
    Discarded,
    Failed,
}

impl<E: ProcessEngine> PoolCore<E> {
    fn launch_worker(&self, worker_id: WorkerId) -> Result<PoolWorker<E::Session>> {
        let session = match self.engine.start_session(&self.launch_spec) {
            Ok(session) => session,
            Err(source) => {
                tracing::warn!(worker_id = %worker_id, error = %source, "failed to launch worker");
                self.state.on_launch_failure(true);
                self.publish_metrics();
                self.diagnostics.worker_failed(worker_id, &*source);
                return Err(Error::LaunchFailed { worker_id, source });
            }
        };

        if let Some(warmup) = &self.warmup {
            let warmed = catch_unwind(AssertUnwindSafe(|| warmup.perform(&session)))
                .unwrap_or_else(|payload| {
                    Err(CallbackPanicked::from_payload("warmup action", payload.as_ref()).into())
                });
            if let Err(source) = warmed {
                tracing::warn!(worker_id = %worker_id, error = %source, "worker warmup failed");
                close_quietly(worker_id, &session);
                self.state.on_launch_failure(true);
                self.publish_metrics();
                self.diagnostics.worker_failed(worker_id, &*source);
                return Err(Error::WarmupFailed { worker_id, source });
            }
        }

        tracing::debug!(worker_id = %worker_id, "worker launched");
        Ok(PoolWorker::new(worker_id, session, self.clock.now()))
    }

    fn retire_worker(&self, worker: &PoolWorker<E::Session>, reason: RetirementReason) {
        tracing::debug!(worker_id = %worker.id(), reason = %reason, "retiring worker");
        self.diagnostics.worker_retired(worker.id(), reason);
        self.state.record_retirement();
        close_quietly(worker.id(), worker.session());
        self.publish_metrics();
    }

    /// Launch workers until `min_size` is met, stopping at the first failure.
    fn ensure_minimum_size(&self) {
        if self.config.min_size == 0 {
            return;
        }
        while let Some(worker_id) = self.state.reserve_next_for_minimum() {
            self.publish_metrics();
            match self.prewarm_one(worker_id) {
                Prewarm::Created => self.reset_prewarm_backoff(),
                Prewarm::Discarded => return,
                Prewarm::Failed => {
                    self.prewarm_backoff();
                    return;
                }
            }
        }
        self.reset_prewarm_backoff();
    }

    fn prewarm_one(&self, worker_id: WorkerId) -> Prewarm {
        let Ok(worker) = self.launch_worker(worker_id) else {
            return Prewarm::Failed;
        };
        let worker = Arc::new(worker);
        let launched = self.state.on_launch_success(Arc::clone(&worker));
        self.publish_metrics();
        if let LaunchOutcome::Discarded(reason) = launched {
            self.retire_worker(&worker, reason.retirement_reason());
            return Prewarm::Discarded;
        }
        self.diagnostics.worker_created(worker_id);
        Prewarm::Created
    }

    fn prewarm_backoff(&self) {
        let delay = {
            let mut failures = self.prewarm_failures.lock();
            *failures = (*failures + 1).min(MAX_PREWARM_FAILURES);
            prewarm_delay(*failures)
        };
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off after launch failure");
        (self.sleeper)(delay);
    }

    fn reset_prewarm_backoff(&self) {
        *self.prewarm_failures.lock() = 0;
    }

    fn start_request_deadline(
        self: &Arc<Self>,
        worker: &Arc<PoolWorker<E::Session>>,
        scope: &LeaseScope,
    ) {
        let timeout = self.config.request_timeout;
        if timeout.is_zero() {
            return;
        }
        let core = Arc::downgrade(self);
        let timed_out = Arc::clone(worker);
        let request_id = scope.request_id();
        self.scheduler.schedule(
            worker.id(),
            request_id,
            timeout,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.on_lease_timeout(&timed_out, request_id);
                }
            }),
        );
    }

    fn on_lease_timeout(&self, worker: &Arc<PoolWorker<E::Session>>, request_id: RequestId) {
        if !self.scheduler.complete(worker.id(), request_id) {
            return;
        }
        let Some(scope) = self.active_leases.remove(worker.id(), request_id) else {
            return;
        };
        self.release_worker(worker, &scope, ResetRequest::timed_out(request_id));
    }

    fn report_timeout(&self, worker: &PoolWorker<E::Session>, scope: &LeaseScope) {
        tracing::warn!(
            worker_id = %worker.id(),
            request_id = %scope.request_id(),
            timeout_ms = self.config.request_timeout.as_millis() as u64,
            "lease exceeded request timeout, retiring worker"
        );
        self.diagnostics.lease_timed_out(scope);
        let error = Error::request_timed_out(worker.id(), scope.request_id());
        self.diagnostics.worker_failed(worker.id(), &error);
    }

    pub(crate) fn reset_lease(
        &self,
        worker: &PoolWorker<E::Session>,
        scope: &LeaseScope,
        request: ResetRequest,
    ) {
        if let RetireDecision::Retire(reason) = self.hooks.run(worker, scope, &request) {
            self.state.flag_retirement(worker, scope.request_id(), reason);
        }
    }

    pub(crate) fn release_lease(&self, worker: &Arc<PoolWorker<E::Session>>, scope: &LeaseScope) {
        self.scheduler.cancel(worker.id());
        self.active_leases.remove(worker.id(), scope.request_id());
        self.release_worker(worker, scope, ResetRequest::lease_completed(scope.request_id()));
    }

    fn release_worker(
        &self,
        worker: &Arc<PoolWorker<E::Session>>,
        scope: &LeaseScope,
        request: ResetRequest,
    ) {
        let timed_out = request.reason() == ResetReason::TimedOut;
        let now = self.clock.now();
        // A timeout that lost the race to the lease's own close, or that fired
        // for a request the worker no longer serves, is ignored here.
        let plan = self.state.begin_release(
            worker,
            scope.request_id(),
            now,
            timed_out.then_some(RetirementReason::RequestTimeout),
        );
        self.publish_metrics();
        if plan == ReleasePlan::Ignore {
            return;
        }
        if timed_out {
            self.report_timeout(worker, scope);
        }

        let plan = match plan {
            ReleasePlan::Keep => match self.hooks.run(worker, scope, &request) {
                RetireDecision::Keep => ReleasePlan::Keep,
                RetireDecision::Retire(reason) => ReleasePlan::Retire(reason),
            },
            other => other,
        };

        let outcome = self.state.complete_release(worker, now, plan);
        self.diagnostics.lease_released(scope);
        tracing::debug!(
            worker_id = %worker.id(),
            request_id = %scope.request_id(),
            outcome = ?outcome,
            "lease released"
        );
        self.publish_metrics();

        if let ReleaseOutcome::Retired(reason) = outcome {
            self.retire_worker(worker, reason);
            self.ensure_minimum_size();
        }
    }

    /// Publish a snapshot unless it equals the last one published.
    ///
    /// The snapshot is taken under `last_published`, so the recorded value is
    /// never older than one a concurrent publisher already replaced.
    fn publish_metrics(&self) {
        let metrics = {
            let mut last = self.last_published.lock();
            let metrics = self.state.snapshot();
            if *last == Some(metrics) {
                return;
            }
            *last = Some(metrics);
            metrics
        };
        self.diagnostics.metrics_updated(&metrics);
    }
}

fn close_quietly<S: Session>(worker_id: WorkerId, session: &S) {
    if let Err(error) = session.close() {
        tracing::warn!(worker_id = %worker_id, error = %error, "failed to close worker session");
    }
}

fn prewarm_delay(failures: u32) -> Duration {
    BASE_PREWARM_BACKOFF
        .saturating_mul(failures.max(1))
        .min(MAX_PREWARM_BACKOFF)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 50)]
    #[case(1, 50)]
    #[case(2, 100)]
    #[case(5, 250)]
    #[case(10, 500)]
    #[case(u32::MAX, 500)]
    fn prewarm_delay_grows_linearly_and_caps(#[case] failures: u32, #[case] expected_ms: u64) {
        assert_eq!(prewarm_delay(failures), Duration::from_millis(expected_ms));
    }

    #[test]
    fn last_published_metrics_match_the_settled_pool() {
        let pool = Pool::new(
            crate::testing::ScriptedEngine::new(),
            LaunchSpec::new("scripted-worker"),
            PoolConfig {
                max_size: 3,
                ..PoolConfig::default()
            },
        )
        .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        pool.acquire_timeout(Duration::from_secs(5)).unwrap().close();
                    }
                });
            }
        });

        // Every state change is followed by a publish, so the newest record wins.
        let last = *pool.inner.last_published.lock();
        assert_eq!(last, Some(pool.snapshot()));
    }

    #[test]
    fn preferred_worker_maps_to_optional_id() {
        assert_eq!(PreferredWorker::Any.worker_id(), None);
        assert_eq!(
            PreferredWorker::Specific(WorkerId::new(3)).worker_id(),
            Some(WorkerId::new(3))
        );
        let options = AcquireOptions::new()
            .timeout(Duration::from_millis(5))
            .prefer(WorkerId::new(2));
        assert_eq!(options.timeout, Some(Duration::from_millis(5)));
        assert_eq!(options.preferred, PreferredWorker::Specific(WorkerId::new(2)));
        assert!(options.interrupt.is_none());
    }
}
