//! Adapters between user-facing durations and the kernel's timer
//! representation. Timed waits are the only consumers.

pub use core::time::Duration;
pub use skein_kernel::TimePoint;

use skein_kernel::Kernel;

/// Converts a relative wait budget into an absolute kernel deadline.
pub fn deadline_after(kernel: &dyn Kernel, duration: Duration) -> TimePoint {
    kernel.now() + duration
}
