use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft_sync::Mutex;

#[test]
fn quick_acquire_well_within_deadline() {
    let mutex = Mutex::new(());

    let before = Instant::now();
    let guard = mutex.try_lock_for(Duration::from_millis(100));
    let elapsed = before.elapsed();

    assert!(guard.is_some());
    assert!(elapsed <= Duration::from_millis(100));
}

#[test]
fn relative_timeout_while_held() {
    let mutex = Arc::new(Mutex::new(()));
    let guard = mutex.lock();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            let before = Instant::now();
            let guard = mutex.try_lock_for(Duration::from_millis(1100));
            (guard.is_some(), before.elapsed())
        })
    };

    let (acquired, elapsed) = waiter.join().unwrap();
    assert!(!acquired);
    // The wait must run the full deadline, with a little scheduling slack on
    // both sides.
    assert!(elapsed >= Duration::from_millis(1050), "elapsed: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2000), "elapsed: {elapsed:?}");

    drop(guard);
}

#[test]
fn absolute_timeout_while_held() {
    let mutex = Arc::new(Mutex::new(()));
    let guard = mutex.lock();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(300);
            let guard = mutex.try_lock_until(deadline);
            (guard.is_some(), Instant::now() >= deadline)
        })
    };

    let (acquired, deadline_passed) = waiter.join().unwrap();
    assert!(!acquired);
    assert!(deadline_passed);

    drop(guard);
}

#[test]
fn zero_timeout_is_a_poll() {
    let mutex = Arc::new(Mutex::new(()));
    let guard = mutex.lock();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || {
            let before = Instant::now();
            let guard = mutex.try_lock_for(Duration::ZERO);
            (guard.is_some(), before.elapsed())
        })
    };

    let (acquired, elapsed) = waiter.join().unwrap();
    assert!(!acquired);
    assert!(elapsed < Duration::from_millis(500));

    drop(guard);
}

#[test]
fn timed_wait_succeeds_once_released() {
    let mutex = Arc::new(Mutex::new(0u32));
    let guard = mutex.lock();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || match mutex.try_lock_for(Duration::from_secs(5)) {
            Some(mut guard) => {
                *guard += 1;
                true
            }
            None => false,
        })
    };

    // Keep the waiter parked for a while before handing the lock over.
    thread::sleep(Duration::from_millis(200));
    drop(guard);

    assert!(waiter.join().unwrap());
    assert_eq!(*mutex.lock(), 1);
}

#[test]
fn mutex_is_reusable_after_a_timeout() {
    let mutex = Arc::new(Mutex::new(()));
    let guard = mutex.lock();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        thread::spawn(move || mutex.try_lock_for(Duration::from_millis(100)).is_some())
    };
    assert!(!waiter.join().unwrap());

    // A timed-out waiter must leave no stale sleeper behind: releasing and
    // re-acquiring afterwards has to work exactly as on a fresh mutex.
    drop(guard);
    for _ in 0..100 {
        drop(mutex.lock());
    }
    assert!(!mutex.is_locked());
}

#[test]
fn timeout_race_with_release() {
    // Repeatedly time out at the same instant the holder releases, to
    // exercise the reconciliation path where the sleeper count is already
    // spoken for and the wake has to be drained.
    const ROUNDS: usize = 200;

    let mutex = Arc::new(Mutex::new(()));
    for _ in 0..ROUNDS {
        let guard = mutex.lock();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                // Short enough to regularly expire right as the release
                // happens below.
                mutex.try_lock_for(Duration::from_millis(1)).is_some()
            })
        };

        thread::sleep(Duration::from_millis(1));
        drop(guard);

        // Whichever way the race went, the mutex must end up free again.
        let _ = waiter.join().unwrap();
        let reacquired = mutex.try_lock_for(Duration::from_secs(1));
        assert!(reacquired.is_some());
    }
}
