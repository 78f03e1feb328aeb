use crate::queue::{PriorityQueue, QueueNode};
use crate::sync::critical::IrqKey;
use crate::sync::{TryLockError, TryLockResult};
use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::pin::pin;
use skein_kernel::{Kernel, ThreadId};

/// Binary lock queueing contenders by priority.
///
/// Not reentrant. Ownership passes directly from the unlocking thread to the
/// most urgent waiter, which then resumes already holding the lock. Unlock
/// by a thread that does not own the lock is a contract violation and is
/// deliberately not checked, mirroring the native primitive underneath.
pub struct RawMutex {
    kernel: &'static dyn Kernel,
    owner: Cell<ThreadId>,
    waiters: PriorityQueue,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub fn new(kernel: &'static dyn Kernel) -> RawMutex {
        RawMutex {
            kernel,
            owner: Cell::new(ThreadId::INVALID),
            waiters: PriorityQueue::new(),
        }
    }

    /// Blocks until the lock is owned by the calling thread.
    pub fn lock(&self) {
        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        let me = self.kernel.current_thread_id();
        if !self.owner.get().is_valid() {
            self.owner.set(me);
            self.kernel.restore_interrupts(state);
            return;
        }

        let node = pin!(QueueNode::new(self.kernel.current_thread_priority(), me));
        self.waiters.insert(key, node.as_ref());
        // The unlocking thread unlinks our node and records us as owner
        // before the wakeup, so nothing is left to do on resume.
        unsafe { self.kernel.suspend_current_thread(state) };
        debug_assert_eq!(self.owner.get(), me);
    }

    /// Acquires the lock only if it is free. Never blocks.
    pub fn try_lock(&self) -> bool {
        let state = self.kernel.disable_interrupts();
        let acquired = if !self.owner.get().is_valid() {
            self.owner.set(self.kernel.current_thread_id());
            true
        } else {
            false
        };
        self.kernel.restore_interrupts(state);
        acquired
    }

    /// Releases the lock. If a waiter is queued, ownership transfers to the
    /// most urgent one and the scheduler is given a chance to switch to it.
    pub fn unlock(&self) {
        let state = self.kernel.disable_interrupts();
        let key = unsafe { IrqKey::assume() };
        match self.waiters.remove_head(key) {
            Some((priority, next)) => {
                self.owner.set(next);
                if let Some(handle) = self.kernel.lookup_thread(next) {
                    unsafe { self.kernel.set_runnable(handle) };
                }
                self.kernel.restore_interrupts(state);
                self.kernel.switch_if_higher_priority(priority);
            }
            None => {
                self.owner.set(ThreadId::INVALID);
                self.kernel.restore_interrupts(state);
            }
        }
    }

    /// True when the calling thread owns the lock.
    pub fn is_held_by_current(&self) -> bool {
        let state = self.kernel.disable_interrupts();
        let held = self.owner.get() == self.kernel.current_thread_id();
        self.kernel.restore_interrupts(state);
        held
    }

    /// Releases inside an enclosing critical section, without the switch
    /// check: the caller is about to park and the scheduler will pick the
    /// winner then. Building block of the condition variable's indivisible
    /// unlock-and-sleep.
    pub(crate) fn transfer_or_release(&self, key: IrqKey<'_>) {
        match self.waiters.remove_head(key) {
            Some((_, next)) => {
                self.owner.set(next);
                if let Some(handle) = self.kernel.lookup_thread(next) {
                    unsafe { self.kernel.set_runnable(handle) };
                }
            }
            None => self.owner.set(ThreadId::INVALID),
        }
    }
}

/// Mutual exclusion wrapper holding its protected value, in the shape of the
/// standard library's: access goes through an RAII [`MutexGuard`].
pub struct Mutex<T: ?Sized> {
    lock: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(kernel: &'static dyn Kernel, t: T) -> Mutex<T> {
        Mutex {
            lock: RawMutex::new(kernel),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.lock();
        MutexGuard {
            lock: &self.lock,
            data: &self.data,
        }
    }

    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Ok(MutexGuard {
                lock: &self.lock,
                data: &self.data,
            })
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard)
    }
}

#[inline(always)]
pub(crate) fn guard_raw<'a, T: ?Sized>(guard: &MutexGuard<'a, T>) -> &'a RawMutex {
    guard.lock
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a RawMutex,
    data: &'a UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
