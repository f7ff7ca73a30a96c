//! FIFO queue of blocked acquirers, each with its own wake condition.
//!
//! The queue lives inside the pool's locked state. Assigning a worker wakes
//! exactly the waiter that receives it; freed launch capacity wakes one
//! waiter per free slot to retry; closing wakes everyone.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Handle identifying a queued waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

/// Returned by [`WaiterQueue::enqueue`]; the waiter parks on `wake`.
#[derive(Debug, Clone)]
pub struct WaiterTicket {
    pub id: WaiterId,
    pub wake: Arc<Condvar>,
}

/// How a queued waiter left the queue.
#[derive(Debug)]
pub enum WaitOutcome<W> {
    Assigned(W),
    TimedOut,
    /// Removed by [`WaiterQueue::cancel_all`].
    Cancelled,
    /// Launch capacity freed up; the waiter should run its acquisition again.
    Retry,
    /// Woken by its interrupt. Any worker assigned before the waiter observed
    /// it is handed back so the caller can route it elsewhere.
    Interrupted(Option<W>),
}

#[derive(Debug)]
struct Slot<W> {
    wake: Arc<Condvar>,
    assigned: Option<W>,
    cancelled: bool,
    interrupted: bool,
    retry: bool,
}

impl<W> Slot<W> {
    fn is_pending(&self) -> bool {
        self.assigned.is_none() && !self.cancelled && !self.interrupted && !self.retry
    }
}

pub struct WaiterQueue<W> {
    order: VecDeque<WaiterId>,
    slots: HashMap<WaiterId, Slot<W>>,
    next_id: u64,
    /// Waiters woken to retry that have not settled yet.
    retrying: usize,
}

impl<W> WaiterQueue<W> {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            slots: HashMap::new(),
            next_id: 0,
            retrying: 0,
        }
    }

    /// Append a waiter to the tail.
    pub fn enqueue(&mut self) -> WaiterTicket {
        self.next_id += 1;
        let id = WaiterId(self.next_id);
        let wake = Arc::new(Condvar::new());
        self.slots.insert(
            id,
            Slot {
                wake: Arc::clone(&wake),
                assigned: None,
                cancelled: false,
                interrupted: false,
                retry: false,
            },
        );
        self.order.push_back(id);
        WaiterTicket { id, wake }
    }

    /// Hand `worker` to the head waiter. Gives the worker back if nobody is queued.
    pub fn assign_to_next(&mut self, worker: W) -> Result<(), W> {
        while let Some(id) = self.order.pop_front() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if !slot.is_pending() {
                continue;
            }
            slot.assigned = Some(worker);
            slot.wake.notify_one();
            return Ok(());
        }
        Err(worker)
    }

    /// Wake queued waiters from the head until `free_slots` of them are
    /// retrying. Each woken waiter leaves the queue and settles as
    /// [`WaitOutcome::Retry`].
    pub fn retry_for_capacity(&mut self, free_slots: usize) {
        while self.retrying < free_slots {
            let Some(id) = self.order.pop_front() else {
                return;
            };
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if !slot.is_pending() {
                continue;
            }
            slot.retry = true;
            slot.wake.notify_one();
            self.retrying += 1;
        }
    }

    /// Waiters told to retry that have not yet settled. Their launch slots
    /// are held back from new arrivals.
    pub fn retrying(&self) -> usize {
        self.retrying
    }

    /// Whether `id` is still waiting for an outcome.
    pub fn is_pending(&self, id: WaiterId) -> bool {
        self.slots.get(&id).is_some_and(Slot::is_pending)
    }

    /// Wake every queued waiter with [`WaitOutcome::Cancelled`] and empty the queue.
    /// Waiters that were already assigned keep their worker.
    pub fn cancel_all(&mut self) {
        for id in self.order.drain(..) {
            if let Some(slot) = self.slots.get_mut(&id) {
                if slot.assigned.is_none() {
                    slot.cancelled = true;
                }
                slot.wake.notify_one();
            }
        }
    }

    /// Flag a waiter as interrupted and wake it. Unknown ids are ignored.
    pub fn interrupt(&mut self, id: WaiterId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.interrupted = true;
            slot.wake.notify_one();
        }
    }

    /// Remove the waiter and report how it ended. `timed_out` is the result of
    /// the caller's wait; an assignment that raced the deadline still wins.
    pub fn settle(&mut self, id: WaiterId, timed_out: bool) -> WaitOutcome<W> {
        self.order.retain(|queued| *queued != id);
        let Some(slot) = self.slots.remove(&id) else {
            return WaitOutcome::Cancelled;
        };
        if slot.retry {
            self.retrying -= 1;
        }
        if slot.interrupted {
            return WaitOutcome::Interrupted(slot.assigned);
        }
        if let Some(worker) = slot.assigned {
            return WaitOutcome::Assigned(worker);
        }
        if slot.cancelled {
            return WaitOutcome::Cancelled;
        }
        if slot.retry {
            return WaitOutcome::Retry;
        }
        debug_assert!(timed_out, "waiter settled while still pending");
        WaitOutcome::TimedOut
    }

    /// Number of waiters still queued.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<W> Default for WaiterQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> fmt::Debug for WaiterQueue<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterQueue")
            .field("queued", &self.order.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Interrupt
// ---------------------------------------------------------------------------

type Waker = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct InterruptState {
    triggered: bool,
    waker: Option<Waker>,
}

/// Cancels a blocked acquisition from another thread.
///
/// Clone the handle, pass one copy in
/// [`AcquireOptions`](crate::AcquireOptions) and call [`Interrupt::trigger`]
/// on the other. The handle stays triggered once fired.
#[derive(Clone, Default)]
pub struct Interrupt {
    state: Arc<Mutex<InterruptState>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the interrupt, waking the waiter currently registered (if any).
    pub fn trigger(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.triggered = true;
            state.waker.take()
        };
        if let Some(wake) = waker {
            wake();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.state.lock().triggered
    }

    /// Install the callback run by [`Interrupt::trigger`]. Returns `false`
    /// without installing it when the handle already fired.
    pub(crate) fn register(&self, waker: Waker) -> bool {
        let mut state = self.state.lock();
        if state.triggered {
            return false;
        }
        state.waker = Some(waker);
        true
    }

    /// Drop any installed callback.
    pub(crate) fn clear(&self) {
        self.state.lock().waker = None;
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
