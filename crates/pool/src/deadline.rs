//! Absolute deadlines and the predicate-guarded wait shared by every blocking call.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// Absolute point on the monotonic clock after which a blocking call gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wait until the predicate clears, however long that takes.
    Infinite,
    /// Give up at this instant.
    At(Instant),
}

impl Deadline {
    /// Deadline `timeout` from now. A zero timeout means "wait forever";
    /// a timeout too large to represent also saturates to [`Deadline::Infinite`].
    pub fn after(timeout: Duration) -> Self {
        Self::after_from(timeout, Instant::now())
    }

    /// Same as [`Deadline::after`] with an explicit starting instant.
    pub fn after_from(timeout: Duration, now: Instant) -> Self {
        if timeout.is_zero() {
            return Self::Infinite;
        }
        now.checked_add(timeout).map_or(Self::Infinite, Self::At)
    }

    /// Deadline that has already been reached; blocking calls check once and return.
    pub fn immediate() -> Self {
        Self::At(Instant::now())
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Time left, or `None` for an infinite deadline.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::At(when) => Some(when.saturating_duration_since(Instant::now())),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// How a guarded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitResult {
    /// The predicate stopped blocking.
    Completed,
    /// The deadline passed while the predicate still blocked.
    TimedOut,
}

/// Block on `condvar` while `blocked` holds, re-checking after every wakeup.
///
/// The lock behind `guard` is released while parked and re-acquired before
/// the predicate runs, so the predicate always observes consistent state.
pub fn await_while<T: ?Sized>(
    guard: &mut MutexGuard<'_, T>,
    condvar: &Condvar,
    deadline: Deadline,
    mut blocked: impl FnMut(&mut T) -> bool,
) -> AwaitResult {
    while blocked(&mut **guard) {
        match deadline {
            Deadline::Infinite => condvar.wait(guard),
            Deadline::At(when) => {
                if Instant::now() >= when {
                    return AwaitResult::TimedOut;
                }
                if condvar.wait_until(guard, when).timed_out() && blocked(&mut **guard) {
                    return AwaitResult::TimedOut;
                }
            }
        }
    }
    AwaitResult::Completed
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn zero_timeout_is_infinite() {
        assert_eq!(Deadline::after(Duration::ZERO), Deadline::Infinite);
        assert_eq!(Deadline::Infinite.remaining(), None);
        assert!(!Deadline::Infinite.is_expired());
    }

    #[test]
    fn huge_timeout_saturates() {
        assert!(Deadline::after(Duration::MAX).is_infinite());
    }

    #[test]
    fn finite_deadline_counts_down() {
        let now = Instant::now();
        let deadline = Deadline::after_from(Duration::from_secs(10), now);
        assert_eq!(deadline, Deadline::At(now + Duration::from_secs(10)));
        assert!(deadline.remaining().is_some_and(|left| left <= Duration::from_secs(10)));
        assert!(Deadline::immediate().is_expired());
    }

    #[test]
    fn await_returns_immediately_when_not_blocked() {
        let lock = Mutex::new(false);
        let condvar = Condvar::new();
        let mut guard = lock.lock();
        let result = await_while(&mut guard, &condvar, Deadline::immediate(), |ready| !*ready);
        assert_eq!(result, AwaitResult::TimedOut);

        *guard = true;
        let result = await_while(&mut guard, &condvar, Deadline::immediate(), |ready| !*ready);
        assert_eq!(result, AwaitResult::Completed);
    }

    #[test]
    fn await_times_out_while_predicate_holds() {
        let lock = Mutex::new(());
        let condvar = Condvar::new();
        let mut guard = lock.lock();
        let started = Instant::now();
        let result = await_while(
            &mut guard,
            &condvar,
            Deadline::after(Duration::from_millis(20)),
            |_| true,
        );
        assert_eq!(result, AwaitResult::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn await_wakes_on_notify() {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let remote = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            *remote.0.lock() = true;
            remote.1.notify_one();
        });

        let mut guard = shared.0.lock();
        let result = await_while(&mut guard, &shared.1, Deadline::Infinite, |ready| !*ready);
        assert_eq!(result, AwaitResult::Completed);
        drop(guard);
        handle.join().unwrap();
    }
}
