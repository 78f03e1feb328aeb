use skein::sync::{Condvar, Mutex, TryLockError};
use skein::thread::{self, Builder};
use skein_kernel::Priority;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counter_race(iterations: u32) {
    skein_kernel_sim::run(move |k| {
        let counter = Arc::new(Mutex::new(k, 0u32));
        let mut workers = Vec::new();
        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            let worker = thread::spawn(k, move || {
                for _ in 0..iterations {
                    *counter.lock() += 1;
                }
            })
            .unwrap();
            workers.push(worker);
        }
        for mut worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 2 * iterations);
    });
}

#[test]
fn mutual_exclusion_one_increment() {
    counter_race(1);
}

#[test]
fn mutual_exclusion_ten_increments() {
    counter_race(10);
}

#[test]
fn mutual_exclusion_thousand_increments() {
    counter_race(1000);
}

/// A contended lock() suspends until the owner releases, and the waiter
/// resumes owning the lock.
#[test]
fn lock_blocks_until_owner_releases() {
    skein_kernel_sim::run(|k| {
        let flag = Arc::new(Mutex::new(k, false));
        let held = Arc::clone(&flag);
        // More urgent than the init thread: takes the lock immediately.
        let mut holder = Builder::new()
            .name("holder")
            .priority(Priority::new(6))
            .spawn(k, move || {
                let mut guard = held.lock();
                thread::sleep(k, Duration::from_millis(30));
                *guard = true;
            })
            .unwrap();

        let guard = flag.lock();
        assert!(*guard, "lock acquired before the holder released it");
        drop(guard);
        holder.join().unwrap();
    });
}

#[test]
fn try_lock_never_blocks() {
    skein_kernel_sim::run(|k| {
        let mutex = Arc::new(Mutex::new(k, ()));
        let contended = Arc::new(AtomicBool::new(false));

        let guard = mutex.lock();
        let observer_mutex = Arc::clone(&mutex);
        let observer_saw = Arc::clone(&contended);
        let mut observer = Builder::new()
            .priority(Priority::new(6))
            .spawn(k, move || {
                observer_saw.store(
                    matches!(observer_mutex.try_lock(), Err(TryLockError::WouldBlock)),
                    Ordering::Relaxed,
                );
            })
            .unwrap();
        observer.join().unwrap();
        assert!(contended.load(Ordering::Relaxed));

        drop(guard);
        assert!(mutex.try_lock().is_ok());
    });
}

/// Ownership passes to waiters strictly by priority, not arrival order.
#[test]
fn unlock_transfers_in_priority_order() {
    skein_kernel_sim::run(|k| {
        let contended = Arc::new(Mutex::new(k, ()));
        let record = Arc::new(Mutex::new(k, Vec::<u8>::new()));

        let guard = contended.lock();
        let mut waiters = Vec::new();
        for level in [5u8, 3, 6] {
            let contended = Arc::clone(&contended);
            let record = Arc::clone(&record);
            let waiter = Builder::new()
                .priority(Priority::new(level))
                .spawn(k, move || {
                    let _guard = contended.lock();
                    record.lock().push(level);
                })
                .unwrap();
            waiters.push(waiter);
        }
        drop(guard);

        for mut waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*record.lock(), [3, 5, 6]);
    });
}

/// The condvar's in-section release hands the lock over exactly once even
/// when the new owner is woken while the releaser is still parked.
#[test]
fn release_during_wait_transfers_ownership() {
    skein_kernel_sim::run(|k| {
        let mutex = Arc::new(Mutex::new(k, 0u32));
        let condvar = Arc::new(Condvar::new(k));

        let worker_mutex = Arc::clone(&mutex);
        let worker_condvar = Arc::clone(&condvar);
        let mut worker = Builder::new()
            .priority(Priority::new(6))
            .spawn(k, move || {
                let mut guard = worker_mutex.lock();
                while *guard == 0 {
                    guard = worker_condvar.wait(guard);
                }
                *guard = 2;
            })
            .unwrap();

        {
            // The worker is parked on the condvar; its wait released the
            // mutex, so this lock must succeed without blocking forever.
            let mut guard = mutex.lock();
            *guard = 1;
        }
        condvar.notify_one();
        worker.join().unwrap();
        assert_eq!(*mutex.lock(), 2);
    });
}
