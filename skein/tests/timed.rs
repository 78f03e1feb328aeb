use skein::sync::{Condvar, Mutex};
use skein::thread::{self, Builder};
use skein_kernel::{Kernel, Priority};
use std::sync::Arc;
use std::time::Duration;

/// With nobody notifying, a timed wait reports timeout and only after the
/// deadline has really elapsed.
#[test]
fn wait_timeout_expires() {
    skein_kernel_sim::run(|k| {
        let mutex = Mutex::new(k, ());
        let condvar = Condvar::new(k);

        let before = k.now();
        let guard = mutex.lock();
        let (guard, result) = condvar.wait_timeout(guard, Duration::from_millis(30));
        drop(guard);

        assert!(result.timed_out());
        assert!(k.now() - before >= Duration::from_millis(30));
    });
}

/// A deadline already in the past still parks and wakes through the timer
/// path rather than hanging.
#[test]
fn wait_deadline_in_the_past_times_out() {
    skein_kernel_sim::run(|k| {
        let mutex = Mutex::new(k, ());
        let condvar = Condvar::new(k);

        let guard = mutex.lock();
        let (_guard, result) = condvar.wait_deadline(guard, k.now());
        assert!(result.timed_out());
    });
}

/// A notify arriving before the deadline claims the waiter's node; the wait
/// must report no-timeout even though a timer was armed.
#[test]
fn notify_before_deadline_wins_the_race() {
    skein_kernel_sim::run(|k| {
        let mutex = Arc::new(Mutex::new(k, ()));
        let condvar = Arc::new(Condvar::new(k));

        let notifier_condvar = Arc::clone(&condvar);
        let mut notifier = Builder::new()
            .name("notifier")
            .priority(Priority::new(6))
            .spawn(k, move || {
                thread::sleep(k, Duration::from_millis(30));
                notifier_condvar.notify_one();
            })
            .unwrap();

        let guard = mutex.lock();
        let (guard, result) = condvar.wait_timeout(guard, Duration::from_millis(500));
        drop(guard);

        assert!(!result.timed_out());
        notifier.join().unwrap();
    });
}

/// The timer firing first wins the race; a late notify on the emptied queue
/// is a harmless no-op.
#[test]
fn timeout_before_notify_wins_the_race() {
    skein_kernel_sim::run(|k| {
        let mutex = Arc::new(Mutex::new(k, ()));
        let condvar = Arc::new(Condvar::new(k));

        let notifier_condvar = Arc::clone(&condvar);
        let mut notifier = Builder::new()
            .name("late-notifier")
            .priority(Priority::new(6))
            .spawn(k, move || {
                thread::sleep(k, Duration::from_millis(120));
                notifier_condvar.notify_one();
            })
            .unwrap();

        let guard = mutex.lock();
        let (guard, result) = condvar.wait_timeout(guard, Duration::from_millis(30));
        drop(guard);

        assert!(result.timed_out());
        notifier.join().unwrap();
    });
}

/// Predicate timed wait: satisfied before the deadline reports no-timeout,
/// and the predicate holds at return.
#[test]
fn wait_timeout_while_satisfied() {
    skein_kernel_sim::run(|k| {
        let ready = Arc::new(Mutex::new(k, false));
        let condvar = Arc::new(Condvar::new(k));

        let producer_ready = Arc::clone(&ready);
        let producer_condvar = Arc::clone(&condvar);
        let mut producer = Builder::new()
            .priority(Priority::new(6))
            .spawn(k, move || {
                thread::sleep(k, Duration::from_millis(20));
                *producer_ready.lock() = true;
                producer_condvar.notify_one();
            })
            .unwrap();

        let guard = ready.lock();
        let (guard, result) =
            condvar.wait_timeout_while(guard, Duration::from_millis(500), |ready| !*ready);

        assert!(!result.timed_out());
        assert!(*guard);
        drop(guard);
        producer.join().unwrap();
    });
}

/// Predicate timed wait that never gets satisfied: the predicate is
/// evaluated once more after the deadline and decides the result.
#[test]
fn wait_timeout_while_expires() {
    skein_kernel_sim::run(|k| {
        let ready = Arc::new(Mutex::new(k, false));
        let condvar = Arc::new(Condvar::new(k));

        let guard = ready.lock();
        let (guard, result) =
            condvar.wait_timeout_while(guard, Duration::from_millis(30), |ready| !*ready);

        assert!(result.timed_out());
        assert!(!*guard);
        drop(guard);
    });
}

/// thread::sleep never returns early, even when a stale wakeup from an
/// earlier timed wait is still in flight.
#[test]
fn sleep_holds_for_full_duration() {
    skein_kernel_sim::run(|k| {
        let before = k.now();
        thread::sleep(k, Duration::from_millis(40));
        assert!(k.now() - before >= Duration::from_millis(40));
    });
}
