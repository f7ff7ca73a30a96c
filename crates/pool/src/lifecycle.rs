//! Closing/terminated flags and the drain wait.

use std::sync::Arc;

use parking_lot::{Condvar, MutexGuard};

use crate::deadline::{AwaitResult, Deadline, await_while};

/// Result of waiting for active leases to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No active leases remain. `terminated_now` is true only for the call
    /// that flipped the pool into the terminated state.
    Completed { terminated_now: bool },
    TimedOut,
}

/// Lifecycle flags. Lives inside the pool's locked state.
#[derive(Debug, Default)]
pub struct LifecycleGate {
    closing: bool,
    terminated: bool,
    state_changed: Arc<Condvar>,
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Returns `true` if this call performed the transition.
    pub fn mark_closing(&mut self) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        self.state_changed.notify_all();
        true
    }

    pub fn mark_terminated(&mut self) {
        if self.terminated {
            return;
        }
        self.closing = true;
        self.terminated = true;
        self.state_changed.notify_all();
    }

    /// Wake drain waiters so they re-check their predicate.
    pub fn signal_state_change(&self) {
        self.state_changed.notify_all();
    }

    /// Block while `has_active` reports outstanding leases, up to `deadline`.
    ///
    /// On completion the gate is marked terminated. `gate` projects the gate
    /// out of the locked state so the wait can release and re-take the lock.
    pub fn await_drain<T>(
        guard: &mut MutexGuard<'_, T>,
        deadline: Deadline,
        gate: impl Fn(&mut T) -> &mut Self,
        mut has_active: impl FnMut(&mut T) -> bool,
    ) -> DrainOutcome {
        let signal = Arc::clone(&gate(&mut **guard).state_changed);
        match await_while(guard, &signal, deadline, |state| has_active(state)) {
            AwaitResult::TimedOut => DrainOutcome::TimedOut,
            AwaitResult::Completed => {
                let gate = gate(&mut **guard);
                let terminated_now = !gate.terminated;
                gate.mark_terminated();
                DrainOutcome::Completed { terminated_now }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    struct Fixture {
        gate: LifecycleGate,
        active: usize,
    }

    fn gate_of(fixture: &mut Fixture) -> &mut LifecycleGate {
        &mut fixture.gate
    }

    #[test]
    fn mark_closing_is_idempotent() {
        let mut gate = LifecycleGate::new();
        assert!(gate.mark_closing());
        assert!(!gate.mark_closing());
        assert!(gate.is_closing());
        assert!(!gate.is_terminated());
    }

    #[test]
    fn drain_reports_termination_once() {
        let state = Mutex::new(Fixture {
            gate: LifecycleGate::new(),
            active: 0,
        });
        let mut guard = state.lock();
        guard.gate.mark_closing();

        let first = LifecycleGate::await_drain(&mut guard, Deadline::immediate(), gate_of, |f| {
            f.active > 0
        });
        let second = LifecycleGate::await_drain(&mut guard, Deadline::immediate(), gate_of, |f| {
            f.active > 0
        });
        assert_eq!(first, DrainOutcome::Completed { terminated_now: true });
        assert_eq!(second, DrainOutcome::Completed { terminated_now: false });
        assert!(guard.gate.is_terminated());
    }

    #[test]
    fn drain_times_out_with_active_leases() {
        let state = Mutex::new(Fixture {
            gate: LifecycleGate::new(),
            active: 1,
        });
        let mut guard = state.lock();
        let outcome = LifecycleGate::await_drain(
            &mut guard,
            Deadline::after(Duration::from_millis(10)),
            gate_of,
            |f| f.active > 0,
        );
        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert!(!guard.gate.is_terminated());
    }

    #[test]
    fn drain_wakes_when_last_lease_returns() {
        let state = Mutex::new(Fixture {
            gate: LifecycleGate::new(),
            active: 1,
        });

        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                let mut guard = state.lock();
                guard.active = 0;
                guard.gate.signal_state_change();
            });

            let mut guard = state.lock();
            let outcome =
                LifecycleGate::await_drain(&mut guard, Deadline::Infinite, gate_of, |f| {
                    f.active > 0
                });
            assert_eq!(outcome, DrainOutcome::Completed { terminated_now: true });
        });
    }
}
