//! Simulated kernel for host-side testing of the synchronization layer.
//!
//! The simulator reproduces the contract of a single-core, priority-based
//! preemptive kernel on ordinary host threads: every kernel thread is backed
//! by a `std` thread, but at most one of them executes user code at a time.
//! A thread that is not scheduled parks on a private gate; the scheduler
//! (per-priority FIFO run queues plus a ready bitmap) opens exactly one gate.
//! The global critical section is a reentrant interrupt-flag lock that the
//! timer thread also takes before delivering a wakeup, the way an interrupt
//! handler would.
//!
//! Scheduling decisions happen at the contract's suspension and switch
//! points; a thread that never blocks is never preempted mid-run. That is
//! sufficient for the layer under test, whose observable ordering is defined
//! at exactly those points, and it keeps test runs deterministic.

use bit_field::BitField;
use const_env::from_env;
use skein_kernel::{
    IrqState, Kernel, Priority, SpawnError, ThreadEntry, ThreadHandle, ThreadId, TimePoint,
    TimerHandle, MIN_STACK_SIZE,
};
use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Size of the simulated kernel thread table.
#[from_env("SKEIN_SIM_THREAD_SLOTS")]
const THREAD_SLOTS: usize = 32;

const INIT_STACK_SIZE: usize = 16 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-thread scheduling gate: a backing thread runs user code only while
/// its gate is open, and the scheduler opens one gate at a time.
struct Gate {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            flag: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut flag = lock(&self.flag);
        *flag = true;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut flag = lock(&self.flag);
        while !*flag {
            flag = self.cv.wait(flag).unwrap_or_else(|e| e.into_inner());
        }
        *flag = false;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ThreadState {
    Runnable,
    Running,
    Sleeping,
    Suspended,
}

struct Slot {
    id: ThreadId,
    name: &'static str,
    priority: Priority,
    state: ThreadState,
    gate: Arc<Gate>,
    std_id: std::thread::ThreadId,
}

struct Core {
    slots: Vec<Option<Slot>>,
    /// Slot index of the thread owning the virtual CPU, `None` when idle.
    current: Option<usize>,
    queues: Vec<VecDeque<usize>>,
    /// One bit per priority level with at least one runnable thread.
    ready: u16,
    next_id: u32,
    live: usize,
}

impl Core {
    fn new() -> Core {
        Core {
            slots: (0..THREAD_SLOTS).map(|_| None).collect(),
            current: None,
            queues: (0..skein_kernel::PRIORITY_LEVELS)
                .map(|_| VecDeque::new())
                .collect(),
            ready: 0,
            next_id: 1,
            live: 0,
        }
    }

    fn find_slot(&self, id: ThreadId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.id == id))
    }

    /// Slot of the calling thread, provided it owns the virtual CPU.
    fn current_slot(&self) -> Option<usize> {
        let idx = self.current?;
        let slot = self.slots[idx].as_ref()?;
        (slot.std_id == std::thread::current().id()).then_some(idx)
    }

    fn enqueue(&mut self, idx: usize) {
        let slot = self.slots[idx].as_mut().expect("enqueue of a freed slot");
        slot.state = ThreadState::Runnable;
        let level = slot.priority.level() as usize;
        self.queues[level].push_back(idx);
        self.ready.set_bit(level, true);
    }

    fn enqueue_front(&mut self, idx: usize) {
        let slot = self.slots[idx].as_mut().expect("enqueue of a freed slot");
        slot.state = ThreadState::Runnable;
        let level = slot.priority.level() as usize;
        self.queues[level].push_front(idx);
        self.ready.set_bit(level, true);
    }

    /// Hands the virtual CPU to the most urgent runnable thread, or idles.
    fn schedule_next(&mut self) {
        debug_assert!(self.current.is_none());
        if self.ready == 0 {
            return;
        }
        let level = self.ready.trailing_zeros() as usize;
        let idx = self.queues[level].pop_front().expect("ready bit without a queued thread");
        if self.queues[level].is_empty() {
            self.ready.set_bit(level, false);
        }
        let slot = self.slots[idx].as_mut().expect("scheduled a freed slot");
        slot.state = ThreadState::Running;
        self.current = Some(idx);
        slot.gate.open();
    }

    fn make_runnable(&mut self, idx: usize) {
        self.enqueue(idx);
        if self.current.is_none() {
            self.schedule_next();
        }
    }
}

/// Reentrant interrupt-disable flag standing in for the hardware's global
/// interrupt mask.
struct Irq {
    locked: bool,
    owner: Option<std::thread::ThreadId>,
    depth: usize,
}

struct ArmedTimer {
    handle: u64,
    deadline: TimePoint,
    target: ThreadId,
}

struct Timers {
    armed: Vec<ArmedTimer>,
    next_handle: u64,
}

/// Simulated single-core kernel. Obtain a `&'static` reference (leak one or
/// place it in a `StaticCell`), call [`SimKernel::start`], and drive the
/// synchronization layer from inside the init thread. [`run`] bundles the
/// whole lifecycle for tests.
pub struct SimKernel {
    this: OnceLock<&'static SimKernel>,
    irq: Mutex<Irq>,
    irq_cv: Condvar,
    core: Mutex<Core>,
    idle_cv: Condvar,
    timers: Mutex<Timers>,
    timer_cv: Condvar,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    panics: Mutex<Vec<Box<dyn Any + Send>>>,
    boot: Instant,
}

struct BootArg<F> {
    kernel: &'static SimKernel,
    f: F,
}

unsafe fn boot_entry<F>(arg: *mut core::ffi::c_void)
where
    F: FnOnce(&'static SimKernel) + Send + 'static,
{
    let arg = unsafe { Box::from_raw(arg as *mut BootArg<F>) };
    let BootArg { kernel, f } = *arg;
    f(kernel);
}

struct SendPtr(*mut core::ffi::c_void);
unsafe impl Send for SendPtr {}

impl SimKernel {
    pub fn new() -> SimKernel {
        SimKernel {
            this: OnceLock::new(),
            irq: Mutex::new(Irq {
                locked: false,
                owner: None,
                depth: 0,
            }),
            irq_cv: Condvar::new(),
            core: Mutex::new(Core::new()),
            idle_cv: Condvar::new(),
            timers: Mutex::new(Timers {
                armed: Vec::new(),
                next_handle: 1,
            }),
            timer_cv: Condvar::new(),
            handles: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
            boot: Instant::now(),
        }
    }

    /// Starts the timer thread and boots an init thread running `f` at the
    /// default priority.
    pub fn start<F>(&'static self, f: F)
    where
        F: FnOnce(&'static SimKernel) + Send + 'static,
    {
        if self.this.set(self).is_err() {
            panic!("simulator already started");
        }
        let this: &'static SimKernel = self;
        std::thread::Builder::new()
            .name("skein-sim-timer".into())
            .spawn(move || this.timer_loop())
            .expect("failed to spawn timer thread");

        let stack: &'static mut [u8] = Box::leak(vec![0u8; INIT_STACK_SIZE].into_boxed_slice());
        let arg = Box::into_raw(Box::new(BootArg { kernel: self, f }));
        let entry: ThreadEntry = boot_entry::<F>;
        unsafe {
            self.spawn_thread(
                stack.as_mut_ptr(),
                stack.len(),
                Priority::NORMAL,
                entry,
                arg as *mut core::ffi::c_void,
                "init",
            )
        }
        .expect("failed to spawn init thread");
    }

    /// Waits until every kernel thread has terminated, joins the backing
    /// threads, and re-raises the first panic recorded in any of them.
    ///
    /// A panicking thread can leave others parked with nobody left to wake
    /// them; once a panic has been recorded, the drain wait gives up after a
    /// grace period and surfaces the failure instead.
    pub fn quiesce(&self) {
        let mut core = lock(&self.core);
        while core.live > 0 {
            let (guard, timeout) = self
                .idle_cv
                .wait_timeout(core, Duration::from_secs(1))
                .unwrap_or_else(|e| e.into_inner());
            core = guard;
            if timeout.timed_out() && !lock(&self.panics).is_empty() {
                break;
            }
        }
        let drained = core.live == 0;
        drop(core);

        if drained {
            let handles = mem::take(&mut *lock(&self.handles));
            for handle in handles {
                let _ = handle.join();
            }
        }

        let mut panics = lock(&self.panics);
        let payload = panics.drain(..).next();
        if let Some(payload) = payload {
            drop(panics);
            std::panic::resume_unwind(payload);
        }
    }

    fn this(&self) -> &'static SimKernel {
        self.this.get().expect("simulator not started")
    }

    /// Entry of every backing thread: wait to be scheduled, run the kernel
    /// entry, then retire the slot. A panic in the entry is recorded for
    /// [`SimKernel::quiesce`] after the slot has been cleaned up, so one
    /// failing thread cannot wedge the rest of the simulation.
    fn thread_main(&'static self, idx: usize, id: ThreadId, entry: ThreadEntry, arg: SendPtr) {
        let gate = {
            let core = lock(&self.core);
            Arc::clone(&core.slots[idx].as_ref().expect("spawned slot missing").gate)
        };
        gate.wait();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            entry(arg.0)
        }));

        if result.is_err() {
            self.force_release_irq();
        }
        self.retire_current(idx, id);
        if let Err(payload) = result {
            lock(&self.panics).push(payload);
        }
    }

    /// Drops the interrupt lock if the calling thread died holding it.
    fn force_release_irq(&self) {
        let mut irq = lock(&self.irq);
        if irq.owner == Some(std::thread::current().id()) {
            irq.locked = false;
            irq.owner = None;
            irq.depth = 0;
            self.irq_cv.notify_all();
        }
    }

    fn retire_current(&self, idx: usize, id: ThreadId) {
        let state = self.disable_interrupts();
        {
            let mut core = lock(&self.core);
            debug_assert_eq!(core.current, Some(idx));
            let name = core.slots[idx].as_ref().map_or("?", |slot| slot.name);
            log::trace!("sim: thread {} ({}) retiring", id, name);
            core.slots[idx] = None;
            core.live -= 1;
            core.current = None;
            core.schedule_next();
        }
        self.restore_interrupts(state);
        self.idle_cv.notify_all();
    }

    /// Parks the calling thread in `blocked` state and hands the CPU over.
    /// The thread is parked from the scheduler's point of view before the
    /// critical section is released, so a wakeup racing with the park cannot
    /// be lost.
    fn park_current(&self, state: IrqState, blocked: ThreadState) {
        assert_eq!(
            state.into_raw(),
            0,
            "parking requires the outermost critical section"
        );
        let gate = {
            let mut core = lock(&self.core);
            let idx = core
                .current_slot()
                .expect("park called from outside the running kernel thread");
            let slot = core.slots[idx].as_mut().expect("current slot freed");
            slot.state = blocked;
            let gate = Arc::clone(&slot.gate);
            core.current = None;
            core.schedule_next();
            gate
        };
        self.restore_interrupts(IrqState::from_raw(0));
        gate.wait();
    }

    fn timer_loop(&'static self) {
        loop {
            let mut timers = lock(&self.timers);
            let now = self.now();
            let mut due = Vec::new();
            timers.armed.retain(|timer| {
                if timer.deadline <= now {
                    due.push(timer.target);
                    false
                } else {
                    true
                }
            });
            if !due.is_empty() {
                // Deliver outside the timer list lock: wake_thread takes the
                // interrupt lock, which an armer may hold while it takes the
                // timer list lock.
                drop(timers);
                for target in due {
                    log::trace!("sim: timer wakeup for thread {}", target);
                    self.wake_thread(target);
                }
                continue;
            }

            match timers.armed.iter().map(|timer| timer.deadline).min() {
                Some(earliest) => {
                    let wait = earliest - now;
                    let (guard, _) = self
                        .timer_cv
                        .wait_timeout(timers, wait)
                        .unwrap_or_else(|e| e.into_inner());
                    drop(guard);
                }
                None => {
                    let guard = self
                        .timer_cv
                        .wait(timers)
                        .unwrap_or_else(|e| e.into_inner());
                    drop(guard);
                }
            }
        }
    }
}

impl Default for SimKernel {
    fn default() -> SimKernel {
        SimKernel::new()
    }
}

impl Kernel for SimKernel {
    fn disable_interrupts(&self) -> IrqState {
        let me = std::thread::current().id();
        let mut irq = lock(&self.irq);
        if irq.locked && irq.owner == Some(me) {
            let previous = irq.depth;
            irq.depth += 1;
            return IrqState::from_raw(previous);
        }
        while irq.locked {
            irq = self.irq_cv.wait(irq).unwrap_or_else(|e| e.into_inner());
        }
        irq.locked = true;
        irq.owner = Some(me);
        irq.depth = 1;
        IrqState::from_raw(0)
    }

    fn restore_interrupts(&self, state: IrqState) {
        let raw = state.into_raw();
        let mut irq = lock(&self.irq);
        debug_assert_eq!(irq.owner, Some(std::thread::current().id()));
        if raw == 0 {
            irq.locked = false;
            irq.owner = None;
            irq.depth = 0;
            self.irq_cv.notify_all();
        } else {
            irq.depth = raw;
        }
    }

    fn current_thread_id(&self) -> ThreadId {
        let core = lock(&self.core);
        let idx = core
            .current_slot()
            .expect("current_thread_id called from outside a kernel thread");
        core.slots[idx].as_ref().expect("current slot freed").id
    }

    fn current_thread_priority(&self) -> Priority {
        let core = lock(&self.core);
        let idx = core
            .current_slot()
            .expect("current_thread_priority called from outside a kernel thread");
        core.slots[idx].as_ref().expect("current slot freed").priority
    }

    fn lookup_thread(&self, id: ThreadId) -> Option<ThreadHandle> {
        let core = lock(&self.core);
        core.find_slot(id).map(ThreadHandle::from_raw)
    }

    unsafe fn set_runnable(&self, handle: ThreadHandle) {
        let mut core = lock(&self.core);
        let idx = handle.into_raw();
        let state = core
            .slots
            .get(idx)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.state);
        match state {
            Some(ThreadState::Sleeping) | Some(ThreadState::Suspended) => core.make_runnable(idx),
            _ => {}
        }
    }

    unsafe fn sleep_current_thread(&self, state: IrqState) {
        self.park_current(state, ThreadState::Sleeping);
    }

    unsafe fn suspend_current_thread(&self, state: IrqState) {
        self.park_current(state, ThreadState::Suspended);
    }

    fn wake_thread(&self, id: ThreadId) {
        let state = self.disable_interrupts();
        {
            let mut core = lock(&self.core);
            if let Some(idx) = core.find_slot(id) {
                if core.slots[idx].as_ref().expect("slot freed").state == ThreadState::Sleeping {
                    core.make_runnable(idx);
                }
            }
        }
        self.restore_interrupts(state);
    }

    fn switch_if_higher_priority(&self, priority: Priority) {
        let state = self.disable_interrupts();
        let gate = {
            let mut core = lock(&self.core);
            match core.current_slot() {
                Some(idx) => {
                    let slot = core.slots[idx].as_ref().expect("current slot freed");
                    let (current_priority, gate) = (slot.priority, Arc::clone(&slot.gate));
                    if priority.is_higher_than(current_priority) && core.ready != 0 {
                        // Preempted, not yielding: back to the head of its
                        // own level so FIFO order among equals is kept.
                        core.enqueue_front(idx);
                        core.current = None;
                        core.schedule_next();
                        Some(gate)
                    } else {
                        None
                    }
                }
                // Not a kernel thread; nothing to switch away from.
                None => None,
            }
        };
        self.restore_interrupts(state);
        if let Some(gate) = gate {
            gate.wait();
        }
    }

    unsafe fn spawn_thread(
        &self,
        _stack: *mut u8,
        stack_size: usize,
        priority: Priority,
        entry: ThreadEntry,
        arg: *mut core::ffi::c_void,
        name: &'static str,
    ) -> Result<ThreadId, SpawnError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(SpawnError::StackTooSmall);
        }
        let this = self.this();
        let state = self.disable_interrupts();
        let result = {
            let mut core = lock(&self.core);
            match core.slots.iter().position(Option::is_none) {
                None => Err(SpawnError::NoFreeSlot),
                Some(idx) => {
                    let id = ThreadId::from_raw(core.next_id);
                    core.next_id += 1;

                    let arg = SendPtr(arg);
                    let handle = std::thread::Builder::new()
                        .name(format!("skein-sim-{name}"))
                        .spawn(move || this.thread_main(idx, id, entry, arg))
                        .expect("failed to spawn simulator thread");

                    core.slots[idx] = Some(Slot {
                        id,
                        name,
                        priority,
                        state: ThreadState::Runnable,
                        gate: Arc::new(Gate::new()),
                        std_id: handle.thread().id(),
                    });
                    core.live += 1;
                    // Queue only; the spawner decides whether to yield.
                    core.enqueue(idx);
                    if core.current.is_none() {
                        core.schedule_next();
                    }

                    lock(&self.handles).push(handle);
                    log::trace!("sim: spawned thread {} ({}) at priority {}", id, name, priority);
                    Ok(id)
                }
            }
        };
        self.restore_interrupts(state);
        result
    }

    fn now(&self) -> TimePoint {
        let elapsed = self.boot.elapsed();
        TimePoint::new(elapsed.as_secs(), elapsed.subsec_micros())
    }

    fn arm_oneshot_timer(&self, deadline: TimePoint, target: ThreadId) -> TimerHandle {
        let mut timers = lock(&self.timers);
        let handle = timers.next_handle;
        timers.next_handle += 1;
        timers.armed.push(ArmedTimer {
            handle,
            deadline,
            target,
        });
        self.timer_cv.notify_all();
        TimerHandle::from_raw(handle)
    }

    fn disarm_timer(&self, handle: TimerHandle) {
        let mut timers = lock(&self.timers);
        timers.armed.retain(|timer| timer.handle != handle.into_raw());
    }
}

/// Boots a fresh simulator, runs `f` on the init thread, and tears the
/// simulation down. Each call gets its own kernel, so tests are independent
/// even when the harness runs them in parallel.
pub fn run<F>(f: F)
where
    F: FnOnce(&'static SimKernel) + Send + 'static,
{
    let kernel: &'static SimKernel = Box::leak(Box::new(SimKernel::new()));
    kernel.start(f);
    kernel.quiesce();
}
