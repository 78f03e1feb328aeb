use crate::error::Error;
use crate::queue::{PriorityQueue, QueueNode};
use crate::sync::critical::IrqKey;
use crate::sync::mutex::{self, MutexGuard, RawMutex};
use crate::time;
use core::pin::pin;
use core::time::Duration;
use skein_kernel::{Kernel, Priority, TimePoint};

/// Whether a timed wait returned because its deadline elapsed.
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// How a wait was ended: by a notifier claiming the node, or by the waiter
/// unlinking its own node after a timer or spurious wakeup.
#[derive(PartialEq, Eq)]
enum WakeKind {
    Claimed,
    Unqueued,
}

/// Condition variable over a priority-ordered waiter queue.
///
/// Waiters park in priority order, first-in-first-out among equals, and a
/// thread appears in the queue at most once. Wakeups may be spurious; use
/// the predicate variants unless the surrounding loop re-checks its
/// condition anyway.
pub struct Condvar {
    kernel: &'static dyn Kernel,
    waiters: PriorityQueue,
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub fn new(kernel: &'static dyn Kernel) -> Condvar {
        Condvar {
            kernel,
            waiters: PriorityQueue::new(),
        }
    }

    /// Core wait path. Enqueues the caller, releases the mutex and parks in
    /// one critical section, so no notification can slip into a gap between
    /// release and park. If `deadline` is set, a one-shot timer targeting
    /// the caller is armed inside the same section, so it cannot fire before
    /// the caller is parked.
    ///
    /// On resume, checking the node's claim mark and unlinking the node are
    /// again one critical section: exactly one of notifier and waiter
    /// processes the node. Reacquiring the mutex afterwards is the ordinary
    /// blocking path, outside the indivisible step.
    fn park_on(&self, lock: &RawMutex, deadline: Option<TimePoint>) -> WakeKind {
        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        let me = self.kernel.current_thread_id();
        let node = pin!(QueueNode::new(self.kernel.current_thread_priority(), me));
        self.waiters.insert(key, node.as_ref());
        lock.transfer_or_release(key);
        let timer = deadline.map(|at| self.kernel.arm_oneshot_timer(at, me));
        unsafe { self.kernel.sleep_current_thread(state) };

        if let Some(timer) = timer {
            self.kernel.disarm_timer(timer);
        }

        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        let kind = if node.is_claimed(key) {
            WakeKind::Claimed
        } else {
            self.waiters.remove(key, node.as_ref());
            WakeKind::Unqueued
        };
        self.kernel.restore_interrupts(state);

        lock.lock();
        kind
    }

    /// Timed core wait. Reports timeout only when no notifier claimed the
    /// node and the deadline has really elapsed; a spurious wakeup before
    /// the deadline reports no-timeout.
    fn park_until(&self, lock: &RawMutex, deadline: TimePoint) -> bool {
        let kind = self.park_on(lock, Some(deadline));
        kind == WakeKind::Unqueued && self.kernel.now() >= deadline
    }

    /// Waits on a raw lock that the calling thread must currently hold.
    pub fn wait_raw(&self, lock: &RawMutex) -> Result<(), Error> {
        if !lock.is_held_by_current() {
            return Err(Error::NotOwner);
        }
        self.park_on(lock, None);
        Ok(())
    }

    /// Releases the guarded mutex, parks until notified (or spuriously
    /// woken), and reacquires the mutex before returning the guard.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.park_on(mutex::guard_raw(&guard), None);
        guard
    }

    /// Waits as long as `condition` holds, absorbing spurious wakeups.
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        duration: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let deadline = time::deadline_after(self.kernel, duration);
        self.wait_deadline(guard, deadline)
    }

    pub fn wait_deadline<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: TimePoint,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let timed_out = self.park_until(mutex::guard_raw(&guard), deadline);
        (guard, WaitTimeoutResult(timed_out))
    }

    pub fn wait_timeout_while<'a, T: ?Sized, F>(
        &self,
        guard: MutexGuard<'a, T>,
        duration: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = time::deadline_after(self.kernel, duration);
        self.wait_deadline_while(guard, deadline, condition)
    }

    /// Waits as long as `condition` holds or until `deadline`. After a
    /// timeout the condition is evaluated once more and its value decides
    /// the reported result.
    pub fn wait_deadline_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: TimePoint,
        mut condition: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            if self.park_until(mutex::guard_raw(&guard), deadline) {
                let still_waiting = condition(&mut *guard);
                return (guard, WaitTimeoutResult(still_waiting));
            }
        }
        (guard, WaitTimeoutResult(false))
    }

    /// Wakes the most urgent waiter, if any. The woken thread's node is
    /// claimed and unlinked here, so a concurrent timeout cannot wake it a
    /// second time.
    pub fn notify_one(&self) {
        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        let woken = self.waiters.remove_head(key).map(|(priority, thread)| {
            if let Some(handle) = self.kernel.lookup_thread(thread) {
                unsafe { self.kernel.set_runnable(handle) };
            }
            priority
        });
        self.kernel.restore_interrupts(state);

        if let Some(priority) = woken {
            self.kernel.switch_if_higher_priority(priority);
        }
    }

    /// Wakes every queued waiter, leaving the queue empty, then runs a
    /// single switch check at the most urgent woken priority.
    pub fn notify_all(&self) {
        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        let mut woken: Option<Priority> = None;
        while let Some((priority, thread)) = self.waiters.remove_head(key) {
            if let Some(handle) = self.kernel.lookup_thread(thread) {
                unsafe { self.kernel.set_runnable(handle) };
            }
            woken = Some(match woken {
                Some(best) => best.max(priority),
                None => priority,
            });
        }
        self.kernel.restore_interrupts(state);

        if let Some(priority) = woken {
            self.kernel.switch_if_higher_priority(priority);
        }
    }
}
