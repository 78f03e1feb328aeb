use thiserror::Error;

/// Usage violations detected by the synchronization layer. Each one is
/// reported synchronously before any shared state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Waiting on a condition variable with a mutex the caller does not hold.
    #[error("calling thread does not hold the mutex")]
    NotOwner,
    /// Joining the calling thread's own handle.
    #[error("joining the current thread would deadlock")]
    WouldDeadlock,
    /// Join or detach on a handle that no longer refers to a thread.
    #[error("thread handle is not joinable")]
    NotJoinable,
}
