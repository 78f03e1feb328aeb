//! Blocking synchronization primitives.
//!
//! Everything here is built on two kernel facilities: the global critical
//! section (witnessed by [`IrqKey`]) and the park/wake primitives. All
//! shared-state mutation happens inside the critical section; there is no
//! finer-grained locking at this layer.

pub mod condvar;
pub mod critical;
pub mod mutex;

pub use condvar::{Condvar, WaitTimeoutResult};
pub use critical::{with_interrupts_disabled, IrqKey};
pub use mutex::{Mutex, MutexGuard, RawMutex};

pub type TryLockResult<Guard> = Result<Guard, TryLockError>;

#[derive(Debug, PartialEq, Eq)]
pub enum TryLockError {
    WouldBlock,
}
