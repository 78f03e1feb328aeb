//! Interface to the kernel underneath the synchronization layer.
//!
//! The scheduler, thread table, and alarm clock live in the kernel, not in
//! this workspace. Everything the synchronization layer needs from them is
//! collected into the [`Kernel`] trait so that the layer can be driven by a
//! real port on hardware or by a simulated kernel in tests. Consumers hold an
//! injected `&'static dyn Kernel` and never touch kernel state directly.

#![no_std]

mod time;

pub use time::TimePoint;

use core::ffi::c_void;
use core::fmt;
use thiserror::Error;

/// Number of scheduling priority levels. Level 0 is the most urgent.
pub const PRIORITY_LEVELS: u8 = 16;

/// Smallest stack a kernel port accepts for [`Kernel::spawn_thread`].
pub const MIN_STACK_SIZE: usize = 512;

/// Scheduling priority of a thread. Lower level means more urgent.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS - 1);
    pub const NORMAL: Priority = Priority(7);

    /// # Panics
    ///
    /// Panics if `level >= PRIORITY_LEVELS`.
    pub const fn new(level: u8) -> Priority {
        assert!(level < PRIORITY_LEVELS);
        Priority(level)
    }

    pub const fn level(self) -> u8 {
        self.0
    }

    pub const fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    /// Returns the more urgent of the two priorities.
    pub const fn max(self, other: Priority) -> Priority {
        if self.0 < other.0 { self } else { other }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a kernel thread. Identifiers are handed out by the kernel
/// and are never reused for the lifetime of a kernel instance; a stale id
/// simply fails [`Kernel::lookup_thread`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Sentinel marking "no thread". Never assigned to a live thread.
    pub const INVALID: ThreadId = ThreadId(0);

    pub const fn from_raw(raw: u32) -> ThreadId {
        ThreadId(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a live entry in the kernel thread table, obtained
/// from [`Kernel::lookup_thread`]. Valid only within the critical section it
/// was resolved in.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ThreadHandle(usize);

impl ThreadHandle {
    pub const fn from_raw(raw: usize) -> ThreadHandle {
        ThreadHandle(raw)
    }

    pub const fn into_raw(self) -> usize {
        self.0
    }
}

/// Opaque reference to an armed one-shot timer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const fn from_raw(raw: u64) -> TimerHandle {
        TimerHandle(raw)
    }

    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

/// Saved interrupt state returned by [`Kernel::disable_interrupts`].
///
/// Deliberately not `Copy`: every disable is paired with exactly one restore
/// or park call, and the type system enforces it.
#[derive(Debug)]
pub struct IrqState(usize);

impl IrqState {
    pub const fn from_raw(raw: usize) -> IrqState {
        IrqState(raw)
    }

    pub const fn into_raw(self) -> usize {
        self.0
    }
}

/// Fixed entry signature of a kernel thread. The synchronization layer's
/// trampoline adapts arbitrary closures to this signature.
pub type ThreadEntry = unsafe fn(arg: *mut c_void);

/// Why a thread could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("no free slot in the kernel thread table")]
    NoFreeSlot,
    #[error("stack smaller than the kernel minimum")]
    StackTooSmall,
}

/// Capabilities the synchronization layer consumes from the kernel.
///
/// The kernel is single-core with a preemptive priority scheduler: a thread
/// runs until it blocks, yields, or a strictly more urgent thread becomes
/// runnable. The global critical section (`disable_interrupts` /
/// `restore_interrupts`) is the only mutual exclusion below this layer.
///
/// Threads block in one of two states:
///
/// * *sleeping* — entered through [`sleep_current_thread`], left through
///   [`wake_thread`] or [`set_runnable`];
/// * *suspended* — entered through [`suspend_current_thread`], left only
///   through [`set_runnable`].
///
/// [`wake_thread`] is a no-op on a suspended thread, which is what keeps a
/// late one-shot timer from disturbing a thread that has moved on to block
/// on a lock.
///
/// [`sleep_current_thread`]: Kernel::sleep_current_thread
/// [`suspend_current_thread`]: Kernel::suspend_current_thread
/// [`wake_thread`]: Kernel::wake_thread
/// [`set_runnable`]: Kernel::set_runnable
pub trait Kernel: Sync {
    /// Enters the global critical section. Nestable; each call returns a
    /// state that must be consumed by exactly one `restore_interrupts`,
    /// `sleep_current_thread`, or `suspend_current_thread` call.
    fn disable_interrupts(&self) -> IrqState;

    /// Leaves the critical section entered by the matching
    /// [`Kernel::disable_interrupts`].
    fn restore_interrupts(&self, state: IrqState);

    fn current_thread_id(&self) -> ThreadId;

    fn current_thread_priority(&self) -> Priority;

    /// Resolves a thread id against the thread table. Returns `None` once
    /// the thread has terminated.
    fn lookup_thread(&self, id: ThreadId) -> Option<ThreadHandle>;

    /// Makes a blocked thread runnable. Does not switch; the caller decides
    /// when to run [`Kernel::switch_if_higher_priority`].
    ///
    /// # Safety
    ///
    /// The caller must hold the critical section in which `handle` was
    /// resolved, and the thread must be sleeping or suspended.
    unsafe fn set_runnable(&self, handle: ThreadHandle);

    /// Parks the calling thread in the *sleeping* state and switches away.
    /// The thread is parked before interrupts are logically restored, so a
    /// wakeup racing with the call cannot be lost. Returns, with the
    /// critical section released, once the thread has been woken.
    ///
    /// # Safety
    ///
    /// `state` must come from the caller's outermost
    /// [`Kernel::disable_interrupts`] on this kernel.
    unsafe fn sleep_current_thread(&self, state: IrqState);

    /// Like [`Kernel::sleep_current_thread`], but parks in the *suspended*
    /// state, which [`Kernel::wake_thread`] does not affect.
    ///
    /// # Safety
    ///
    /// Same contract as [`Kernel::sleep_current_thread`].
    unsafe fn suspend_current_thread(&self, state: IrqState);

    /// Wakes a *sleeping* thread. No-op for any other state or for a stale
    /// id. Enters the critical section itself and may be called from timer
    /// context.
    fn wake_thread(&self, id: ThreadId);

    /// Yields the processor if a runnable thread at `priority` would win it:
    /// called outside the critical section after wakeups have been queued.
    fn switch_if_higher_priority(&self, priority: Priority);

    /// Creates and starts a thread running `entry(arg)` on the given stack.
    /// The kernel reclaims the thread when `entry` returns.
    ///
    /// # Safety
    ///
    /// `stack` must point to `stack_size` bytes owned by the caller and kept
    /// alive until the thread terminates; `arg` must stay valid until
    /// `entry` consumes it.
    unsafe fn spawn_thread(
        &self,
        stack: *mut u8,
        stack_size: usize,
        priority: Priority,
        entry: ThreadEntry,
        arg: *mut c_void,
        name: &'static str,
    ) -> Result<ThreadId, SpawnError>;

    /// Current kernel time since boot.
    fn now(&self) -> TimePoint;

    /// Arms a one-shot timer that calls [`Kernel::wake_thread`] on `target`
    /// at `deadline`. A deadline in the past fires immediately.
    fn arm_oneshot_timer(&self, deadline: TimePoint, target: ThreadId) -> TimerHandle;

    /// Cancels a one-shot timer. Idempotent; a timer that has already fired
    /// or been disarmed is ignored.
    fn disarm_timer(&self, handle: TimerHandle);
}
