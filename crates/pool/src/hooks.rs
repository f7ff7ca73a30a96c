//! Warmup and reset hooks.
//!
//! A [`WarmupAction`] runs once on every freshly launched session before the
//! worker becomes visible. [`ResetHook`]s run in registration order on the
//! releasing thread after every lease and decide whether the worker is fit
//! to be reused.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::diagnostics::SharedDiagnostics;
use crate::error::BoxError;
use crate::retirement::RetirementReason;
use crate::scope::{LeaseScope, RequestId};
use crate::worker::PoolWorker;

// ---------------------------------------------------------------------------
// Reset requests
// ---------------------------------------------------------------------------

/// Why reset hooks are being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResetReason {
    /// The lease was closed normally.
    LeaseCompleted,
    /// The lease holder called [`Lease::reset`](crate::Lease::reset).
    Manual,
    /// The lease overran its request deadline.
    TimedOut,
}

/// Reset invocation passed to every hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequest {
    reason: ResetReason,
    request_id: RequestId,
    retire: bool,
}

impl ResetRequest {
    pub fn lease_completed(request_id: RequestId) -> Self {
        Self::new(ResetReason::LeaseCompleted, request_id)
    }

    pub fn manual(request_id: RequestId) -> Self {
        Self::new(ResetReason::Manual, request_id)
    }

    pub fn timed_out(request_id: RequestId) -> Self {
        Self::new(ResetReason::TimedOut, request_id)
    }

    fn new(reason: ResetReason, request_id: RequestId) -> Self {
        Self {
            reason,
            request_id,
            retire: false,
        }
    }

    /// Ask for the worker to be retired regardless of what the hooks decide.
    pub fn retire(mut self) -> Self {
        self.retire = true;
        self
    }

    pub fn reason(&self) -> ResetReason {
        self.reason
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn retire_requested(&self) -> bool {
        self.retire
    }
}

/// Verdict of a single reset hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetOutcome {
    Continue,
    Retire,
}

/// Decision of the whole hook chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireDecision {
    Keep,
    Retire(RetirementReason),
}

// ---------------------------------------------------------------------------
// Hook traits
// ---------------------------------------------------------------------------

/// Post-lease validation or cleanup for a session.
pub trait ResetHook<S>: Send + Sync {
    fn reset(
        &self,
        session: &S,
        scope: &LeaseScope,
        request: &ResetRequest,
    ) -> Result<ResetOutcome, BoxError>;
}

impl<S, F> ResetHook<S> for F
where
    F: Fn(&S, &LeaseScope, &ResetRequest) -> Result<ResetOutcome, BoxError> + Send + Sync,
{
    fn reset(
        &self,
        session: &S,
        scope: &LeaseScope,
        request: &ResetRequest,
    ) -> Result<ResetOutcome, BoxError> {
        self(session, scope, request)
    }
}

/// One-time preparation of a freshly launched session. An error aborts the launch.
pub trait WarmupAction<S>: Send + Sync {
    fn perform(&self, session: &S) -> Result<(), BoxError>;
}

impl<S, F> WarmupAction<S> for F
where
    F: Fn(&S) -> Result<(), BoxError> + Send + Sync,
{
    fn perform(&self, session: &S) -> Result<(), BoxError> {
        self(session)
    }
}

/// A user callback (warmup action or reset hook) panicked.
#[derive(Debug, thiserror::Error)]
#[error("{callback} panicked: {message}")]
pub struct CallbackPanicked {
    pub callback: &'static str,
    pub message: String,
}

impl CallbackPanicked {
    pub(crate) fn from_payload(callback: &'static str, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { callback, message }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs the configured reset hooks for a worker.
pub struct ResetHookRunner<S> {
    hooks: Vec<Arc<dyn ResetHook<S>>>,
    diagnostics: SharedDiagnostics,
}

impl<S> ResetHookRunner<S> {
    pub fn new(hooks: Vec<Arc<dyn ResetHook<S>>>, diagnostics: SharedDiagnostics) -> Self {
        Self { hooks, diagnostics }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Decide whether `worker` stays in circulation.
    ///
    /// A worker already flagged for retirement keeps its reason and skips the
    /// hooks, unless the flag came with a request timeout, in which case the
    /// hooks still run (they may want to observe the timed-out session).
    pub fn run(
        &self,
        worker: &PoolWorker<S>,
        scope: &LeaseScope,
        request: &ResetRequest,
    ) -> RetireDecision {
        let flagged = worker.retirement_reason();
        if let Some(reason) = flagged
            && request.reason() != ResetReason::TimedOut
        {
            return RetireDecision::Retire(reason);
        }

        for hook in &self.hooks {
            let result = catch_unwind(AssertUnwindSafe(|| {
                hook.reset(worker.session(), scope, request)
            }));
            match result {
                Ok(Ok(ResetOutcome::Continue)) => {}
                Ok(Ok(ResetOutcome::Retire)) => {
                    return RetireDecision::Retire(RetirementReason::ResetHookRequested);
                }
                Ok(Err(error)) => {
                    tracing::warn!(worker_id = %worker.id(), error = %error, "reset hook failed");
                    self.diagnostics.worker_failed(worker.id(), &*error);
                    return RetireDecision::Retire(RetirementReason::ResetHookFailure);
                }
                Err(payload) => {
                    let error = CallbackPanicked::from_payload("reset hook", payload.as_ref());
                    tracing::warn!(worker_id = %worker.id(), error = %error, "reset hook panicked");
                    self.diagnostics.worker_failed(worker.id(), &error);
                    return RetireDecision::Retire(RetirementReason::ResetHookFailure);
                }
            }
        }

        match flagged {
            Some(reason) => RetireDecision::Retire(reason),
            None if request.retire_requested() => {
                RetireDecision::Retire(RetirementReason::RetireRequested)
            }
            None => RetireDecision::Keep,
        }
    }
}

impl<S> fmt::Debug for ResetHookRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetHookRunner")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::diagnostics::PoolDiagnostics;
    use crate::scope::WorkerId;

    #[derive(Default)]
    struct RecordingDiagnostics {
        failures: Mutex<Vec<(WorkerId, String)>>,
    }

    impl PoolDiagnostics for RecordingDiagnostics {
        fn worker_failed(&self, worker_id: WorkerId, error: &(dyn std::error::Error + 'static)) {
            self.failures.lock().push((worker_id, error.to_string()));
        }
    }

    fn leased_worker() -> (PoolWorker<()>, LeaseScope) {
        let now = Instant::now();
        let worker = PoolWorker::new(WorkerId::new(3), (), now);
        let scope = LeaseScope::new(worker.id(), now, now, 0);
        (worker, scope)
    }

    fn runner(
        hooks: Vec<Arc<dyn ResetHook<()>>>,
    ) -> (ResetHookRunner<()>, Arc<RecordingDiagnostics>) {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        (ResetHookRunner::new(hooks, diagnostics.clone()), diagnostics)
    }

    fn counting(counter: &Arc<AtomicUsize>, outcome: ResetOutcome) -> Arc<dyn ResetHook<()>> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &(), _: &LeaseScope, _: &ResetRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(outcome)
        })
    }

    #[test]
    fn keeps_worker_when_every_hook_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (runner, _) = runner(vec![
            counting(&calls, ResetOutcome::Continue),
            counting(&calls, ResetOutcome::Continue),
        ]);
        let (worker, scope) = leased_worker();
        let decision = runner.run(&worker, &scope, &ResetRequest::lease_completed(scope.request_id()));
        assert_eq!(decision, RetireDecision::Keep);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn first_retire_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (runner, _) = runner(vec![
            counting(&calls, ResetOutcome::Retire),
            counting(&calls, ResetOutcome::Continue),
        ]);
        let (worker, scope) = leased_worker();
        let decision = runner.run(&worker, &scope, &ResetRequest::manual(scope.request_id()));
        assert_eq!(
            decision,
            RetireDecision::Retire(RetirementReason::ResetHookRequested)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_error_is_reported_and_distinct_from_retire_request() {
        let failing: Arc<dyn ResetHook<()>> =
            Arc::new(|_: &(), _: &LeaseScope, _: &ResetRequest| Err("session wedged".into()));
        let (runner, diagnostics) = runner(vec![failing]);
        let (worker, scope) = leased_worker();
        let decision = runner.run(&worker, &scope, &ResetRequest::lease_completed(scope.request_id()));
        assert_eq!(
            decision,
            RetireDecision::Retire(RetirementReason::ResetHookFailure)
        );
        assert_eq!(
            *diagnostics.failures.lock(),
            vec![(WorkerId::new(3), "session wedged".to_string())]
        );
    }

    #[test]
    fn hook_panic_counts_as_failure() {
        let panicking: Arc<dyn ResetHook<()>> =
            Arc::new(|_: &(), _: &LeaseScope, _: &ResetRequest| -> Result<ResetOutcome, BoxError> {
                panic!("boom")
            });
        let (runner, diagnostics) = runner(vec![panicking]);
        let (worker, scope) = leased_worker();
        let decision = runner.run(&worker, &scope, &ResetRequest::lease_completed(scope.request_id()));
        assert_eq!(
            decision,
            RetireDecision::Retire(RetirementReason::ResetHookFailure)
        );
        assert_eq!(diagnostics.failures.lock()[0].1, "reset hook panicked: boom");
    }

    #[test]
    fn flagged_worker_skips_hooks_unless_timed_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (runner, _) = runner(vec![counting(&calls, ResetOutcome::Continue)]);
        let (worker, scope) = leased_worker();
        worker.request_retire(RetirementReason::RetireRequested);

        let decision = runner.run(&worker, &scope, &ResetRequest::lease_completed(scope.request_id()));
        assert_eq!(decision, RetireDecision::Retire(RetirementReason::RetireRequested));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let (timed_out, scope) = leased_worker();
        timed_out.request_retire(RetirementReason::RequestTimeout);
        let decision = runner.run(&timed_out, &scope, &ResetRequest::timed_out(scope.request_id()));
        assert_eq!(decision, RetireDecision::Retire(RetirementReason::RequestTimeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_retire_request_without_hooks() {
        let (runner, _) = runner(Vec::new());
        let (worker, scope) = leased_worker();
        let decision = runner.run(
            &worker,
            &scope,
            &ResetRequest::manual(scope.request_id()).retire(),
        );
        assert_eq!(decision, RetireDecision::Retire(RetirementReason::RetireRequested));
    }
}
