//! Kernel thread handles with join/detach lifetime management.
//!
//! A handle and the running thread body share one heap-held state block, so
//! either side can go away first: the block is freed when the second owner
//! releases its reference, never earlier and never twice. This is what makes
//! detach and handle moves safe while the thread is still running on the
//! stack the block owns.

use crate::error::Error;
use crate::stack::Stack;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ffi::c_void;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;
use skein_kernel::{Kernel, Priority, SpawnError, ThreadEntry, ThreadId};

pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_PRIORITY: Priority = Priority::NORMAL;

/// State shared between a [`Thread`] handle and the spawned body: two strong
/// references, one per owner. The `joiner`/`finished` pair is only accessed
/// inside the global critical section; the atomics exist for shared access,
/// not for standalone ordering.
struct ThreadData {
    /// Raw id of the thread sleeping in `join`, `ThreadId::INVALID` if none.
    joiner: AtomicU32,
    finished: AtomicBool,
    stack: Stack,
}

/// Argument carried through the kernel's fixed entry signature.
struct TrampolineArg<F> {
    kernel: &'static dyn Kernel,
    data: Arc<ThreadData>,
    body: F,
}

/// Completion signalling lives in a drop guard so that it runs however the
/// body ends: normal return, or a panic unwinding towards the kernel
/// boundary. Marks the thread finished, wakes a registered joiner, and
/// releases the body's reference to the shared state.
struct Completion {
    kernel: &'static dyn Kernel,
    data: Arc<ThreadData>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let state = self.kernel.disable_interrupts();
        self.data.finished.store(true, Ordering::Relaxed);
        let joiner = ThreadId::from_raw(self.data.joiner.load(Ordering::Relaxed));
        if joiner.is_valid() {
            self.kernel.wake_thread(joiner);
        }
        self.kernel.restore_interrupts(state);
        log::trace!("thread {} finished", self.kernel.current_thread_id());
    }
}

unsafe fn trampoline<F: FnOnce() + Send + 'static>(arg: *mut c_void) {
    let arg = unsafe { Box::from_raw(arg as *mut TrampolineArg<F>) };
    let TrampolineArg { kernel, data, body } = *arg;
    let _completion = Completion { kernel, data };
    body();
}

/// Thread spawn configuration, in the shape of the standard library's
/// builder.
pub struct Builder {
    name: &'static str,
    stack_size: usize,
    priority: Priority,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: "skein",
            stack_size: DEFAULT_STACK_SIZE,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn name(mut self, name: &'static str) -> Builder {
        self.name = name;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.stack_size = stack_size;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Builder {
        self.priority = priority;
        self
    }

    /// Spawns a kernel thread running `body`. On error the handle never
    /// comes into existence and nothing has started.
    pub fn spawn<F>(self, kernel: &'static dyn Kernel, body: F) -> Result<Thread, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let data = Arc::new(ThreadData {
            joiner: AtomicU32::new(ThreadId::INVALID.as_raw()),
            finished: AtomicBool::new(false),
            stack: Stack::alloc(self.stack_size),
        });
        let stack_ptr = data.stack.bottom_ptr();
        let stack_size = data.stack.size();
        let arg = Box::into_raw(Box::new(TrampolineArg {
            kernel,
            data: Arc::clone(&data),
            body,
        }));

        let entry: ThreadEntry = trampoline::<F>;
        let id = match unsafe {
            kernel.spawn_thread(
                stack_ptr,
                stack_size,
                self.priority,
                entry,
                arg as *mut c_void,
                self.name,
            )
        } {
            Ok(id) => id,
            Err(err) => {
                drop(unsafe { Box::from_raw(arg) });
                return Err(err);
            }
        };
        log::trace!("spawned thread {} ({})", id, self.name);

        // A more urgent thread starts running before the spawner continues.
        kernel.switch_if_higher_priority(self.priority);

        Ok(Thread {
            kernel,
            id,
            data: Some(data),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// Spawns a thread with the default name, stack size, and priority.
pub fn spawn<F>(kernel: &'static dyn Kernel, body: F) -> Result<Thread, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(kernel, body)
}

/// Parks the calling thread for at least `duration`. Stray wakeups are
/// absorbed by re-checking the deadline.
pub fn sleep(kernel: &'static dyn Kernel, duration: Duration) {
    let deadline = crate::time::deadline_after(kernel, duration);
    loop {
        let state = kernel.disable_interrupts();
        if kernel.now() >= deadline {
            kernel.restore_interrupts(state);
            return;
        }
        // Armed inside the critical section: the timer cannot fire before
        // the caller is parked.
        let timer = kernel.arm_oneshot_timer(deadline, kernel.current_thread_id());
        unsafe { kernel.sleep_current_thread(state) };
        kernel.disarm_timer(timer);
    }
}

/// Owning handle to a spawned kernel thread.
///
/// A handle that still refers to a thread is *joinable*; `join` and `detach`
/// leave it empty. Dropping a joinable handle is a contract violation and
/// panics: silently leaking the thread or letting its stack dangle are both
/// unacceptable outcomes.
pub struct Thread {
    kernel: &'static dyn Kernel,
    id: ThreadId,
    data: Option<Arc<ThreadData>>,
}

impl Thread {
    /// Id of the underlying kernel thread; `ThreadId::INVALID` once the
    /// handle has been joined or detached.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_joinable(&self) -> bool {
        self.data.is_some()
    }

    pub fn swap(&mut self, other: &mut Thread) {
        mem::swap(self, other);
    }

    /// Blocks until the thread body has finished, then releases the handle.
    ///
    /// Registering as joiner and checking for completion happen in one
    /// critical section against the finishing thread's completion path, so
    /// the wakeup cannot be lost; the sleep loop absorbs stray wakeups.
    pub fn join(&mut self) -> Result<(), Error> {
        let data = self.data.as_ref().ok_or(Error::NotJoinable)?;
        if self.kernel.current_thread_id() == self.id {
            return Err(Error::WouldDeadlock);
        }

        loop {
            let state = self.kernel.disable_interrupts();
            if data.finished.load(Ordering::Relaxed) {
                self.kernel.restore_interrupts(state);
                break;
            }
            data.joiner.store(
                self.kernel.current_thread_id().as_raw(),
                Ordering::Relaxed,
            );
            unsafe { self.kernel.sleep_current_thread(state) };
        }

        self.id = ThreadId::INVALID;
        self.data = None;
        Ok(())
    }

    /// Releases the handle without waiting; the thread runs to completion on
    /// its own. Whichever of handle and body is released last frees the
    /// shared state.
    pub fn detach(&mut self) -> Result<(), Error> {
        if self.data.is_none() {
            return Err(Error::NotJoinable);
        }
        self.id = ThreadId::INVALID;
        self.data = None;
        Ok(())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.data.is_some() {
            panic!("thread handle dropped while joinable; join or detach first");
        }
    }
}
