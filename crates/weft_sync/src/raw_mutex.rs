// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')
use core::{
    hint::spin_loop,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

use static_assertions::const_assert;

use crate::{
    lock_imp,
    thread_parker::{park, unpark_one, ParkResult},
    time::{Duration, Instant},
};

// Field layout of the state word, low bits first:
// locked (1) | nspin (7) | nsleep (11) | nspin_fail (7).
const LOCKED_BIT: usize = 1;
const NSPIN_SHIFT: u32 = 1;
const NSLEEP_SHIFT: u32 = 8;
const NSPIN_FAIL_SHIFT: u32 = 19;

const NSPIN_BITS: u32 = 7;
const NSLEEP_BITS: u32 = 11;

/// Saturation point of `nspin` and `nspin_fail`.
const NSPIN_MAX: usize = (1 << NSPIN_BITS) - 1;
const NSLEEP_MASK: usize = (1 << NSLEEP_BITS) - 1;

/// Once `nspin_fail` reaches this, new contenders skip the spin phase and go
/// straight to sleep.
const SPIN_FAIL_THRESHOLD: usize = 16;

/// Pause iterations a lone spinner on a never-contended mutex would burn; the
/// actual budget per spin phase shrinks as `nspin_fail` grows.
const MAX_SPIN_ITERATIONS: usize = 4096;

const_assert!(SPIN_FAIL_THRESHOLD < NSPIN_MAX);
const_assert!(NSPIN_FAIL_SHIFT + NSPIN_BITS <= usize::BITS);
const_assert!(MAX_SPIN_ITERATIONS / NSPIN_MAX > 0);

/// Decoded view of the state word. Transitions are computed on a copy and
/// published by re-encoding the whole word in a single compare-exchange;
/// partial-field updates never happen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct State {
    /// Whether some thread holds the mutex.
    locked: bool,

    /// Number of threads currently in their bounded spin phase.
    nspin: usize,

    /// Number of threads parked on the mutex or committed to parking.
    nsleep: usize,

    /// Recent spin failures; shrinks again on successful acquires.
    nspin_fail: usize,
}

impl State {
    #[inline]
    fn unpack(word: usize) -> State {
        State {
            locked: word & LOCKED_BIT != 0,
            nspin: (word >> NSPIN_SHIFT) & NSPIN_MAX,
            nsleep: (word >> NSLEEP_SHIFT) & NSLEEP_MASK,
            nspin_fail: (word >> NSPIN_FAIL_SHIFT) & NSPIN_MAX,
        }
    }

    #[inline]
    fn pack(self) -> usize {
        debug_assert!(self.nspin <= NSPIN_MAX);
        debug_assert!(self.nsleep <= NSLEEP_MASK);
        debug_assert!(self.nspin_fail <= NSPIN_MAX);
        (self.locked as usize)
            | (self.nspin << NSPIN_SHIFT)
            | (self.nsleep << NSLEEP_SHIFT)
            | (self.nspin_fail << NSPIN_FAIL_SHIFT)
    }
}

/// How long a slow-path acquisition is allowed to wait.
#[derive(Clone, Copy)]
enum Timeout {
    Infinite,
    Absolute(Instant),
    Relative(Duration),
}

/// What the registration transition committed this thread to.
enum Registered {
    Acquired,
    Spin { fail_at_entry: usize },
    Sleep,
}

/// Adaptive word-sized mutex.
///
/// The entire lock state is one atomic word: the lock bit plus counters for
/// spinning threads, sleeping threads, and recent spin failures. Contenders
/// spin a budget proportional to how well spinning has been working on this
/// mutex lately, then park on the mutex address through the
/// [parking lot](crate::thread_parker); a release hands exactly one parked
/// thread a wake.
///
/// A zeroed word is a valid unlocked mutex, so no constructor logic is
/// needed. There is no fairness, no recursion (re-entry deadlocks) and no
/// owner check on unlock.
pub struct RawMutex {
    state: AtomicUsize,
}

unsafe impl lock_imp::RawMutex for RawMutex {
    const INIT: RawMutex = RawMutex {
        state: AtomicUsize::new(0),
    };

    type GuardMarker = lock_imp::GuardSend;

    #[inline]
    fn lock(&self) {
        if !self.try_lock_fast() {
            self.lock_slow(Timeout::Infinite);
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        let mut word = self.state.load(Ordering::Relaxed);
        loop {
            if word & LOCKED_BIT != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                word,
                word | LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        // Clear the lock bit and give back one sleep slot, if any.
        let mut old = State::unpack(self.state.load(Ordering::Relaxed));
        let wake_one = loop {
            let mut new = old;
            new.locked = false;
            let wake_one = old.nsleep != 0;
            if wake_one {
                new.nsleep = (old.nsleep - 1) & NSLEEP_MASK;
            }
            match self.state.compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break wake_one,
                Err(current) => old = State::unpack(current),
            }
        };

        // The sleeper count is given back before the wake is issued; a waiter
        // that times out and finds the count already zero knows a wake is in
        // flight and drains it instead of reporting timeout.
        if wake_one {
            unpark_one(self.key());
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCKED_BIT != 0
    }
}

unsafe impl lock_imp::RawMutexTimed for RawMutex {
    #[inline]
    fn try_lock_for(&self, timeout: Duration) -> bool {
        self.try_lock_fast() || self.lock_slow(Timeout::Relative(timeout))
    }

    #[inline]
    fn try_lock_until(&self, deadline: Instant) -> bool {
        self.try_lock_fast() || self.lock_slow(Timeout::Absolute(deadline))
    }
}

impl RawMutex {
    /// Address that waits on this mutex are keyed by in the parking lot.
    #[inline]
    fn key(&self) -> usize {
        self as *const RawMutex as usize
    }

    /// Single-shot CAS of `locked: 0 -> 1` that leaves every counter
    /// untouched. Any failure, including a counter changing under us, falls
    /// through to the slow path.
    #[inline]
    fn try_lock_fast(&self) -> bool {
        let word = self.state.load(Ordering::Relaxed);
        word & LOCKED_BIT == 0
            && self
                .state
                .compare_exchange(word, word | LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    #[cold]
    fn lock_slow(&self, timeout: Timeout) -> bool {
        // A relative deadline keeps its own elapsed-time ledger across wait
        // rounds; an absolute one is simply handed to the parker each round.
        let mut remaining = match timeout {
            Timeout::Relative(duration) => Some(duration),
            _ => None,
        };
        let mut waiting_since = remaining.map(|_| Instant::now());

        loop {
            // Register intent: take the mutex if it is free, otherwise claim a
            // spin slot, or a sleep slot once spinning is saturated or has
            // been failing.
            let mut old = State::unpack(self.state.load(Ordering::Relaxed));
            let registered = loop {
                let mut new = old;
                let registered = if !old.locked {
                    new.locked = true;
                    // A mutex that can be taken immediately earns back spin
                    // credit.
                    if old.nspin_fail != 0 {
                        new.nspin_fail = (old.nspin_fail - 1) & NSPIN_MAX;
                    }
                    Registered::Acquired
                } else if old.nspin == NSPIN_MAX || old.nspin_fail >= SPIN_FAIL_THRESHOLD {
                    new.nsleep = (old.nsleep + 1) & NSLEEP_MASK;
                    // This contender will not spin, but the failure counter is
                    // charged all the same.
                    if old.nspin_fail != NSPIN_MAX {
                        new.nspin_fail = (old.nspin_fail + 1) & NSPIN_MAX;
                    }
                    Registered::Sleep
                } else {
                    new.nspin = (old.nspin + 1) & NSPIN_MAX;
                    Registered::Spin {
                        fail_at_entry: old.nspin_fail,
                    }
                };
                match self.state.compare_exchange_weak(
                    old.pack(),
                    new.pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break registered,
                    Err(current) => old = State::unpack(current),
                }
            };

            match registered {
                Registered::Acquired => return true,
                Registered::Spin { fail_at_entry } => {
                    if self.spin(fail_at_entry) {
                        return true;
                    }
                }
                Registered::Sleep => {}
            }

            // Park on our own address until a release hands us a wake or the
            // deadline passes.
            let deadline = match timeout {
                Timeout::Infinite => None,
                Timeout::Absolute(deadline) => Some(deadline),
                Timeout::Relative(_) => Some(waiting_since.unwrap() + remaining.unwrap()),
            };
            let result = unsafe { park(self.key(), deadline) };

            if result == ParkResult::TimedOut {
                // Reclaim the sleep slot, unless a release has already
                // consumed it; then its wake is in flight and must be drained
                // rather than abandoned, or a later release would lose it.
                'drain: loop {
                    let mut old = State::unpack(self.state.load(Ordering::Relaxed));
                    loop {
                        if old.nsleep == 0 {
                            break;
                        }
                        let mut new = old;
                        new.nsleep = (old.nsleep - 1) & NSLEEP_MASK;
                        match self.state.compare_exchange_weak(
                            old.pack(),
                            new.pack(),
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => return false,
                            Err(current) => old = State::unpack(current),
                        }
                    }

                    // Poll with an expired deadline: either we drain the wake
                    // addressed to us, or a third contender has registered a
                    // fresh sleeper in the meantime and we retry the
                    // decrement against its slot.
                    if unsafe { park(self.key(), Some(Instant::now())) }.is_unparked() {
                        break 'drain;
                    }
                }
            }

            // Woken by a release; the lock is up for grabs again. Settle the
            // relative ledger before retrying.
            if let (Some(remaining), Some(waiting_since)) =
                (remaining.as_mut(), waiting_since.as_mut())
            {
                let now = Instant::now();
                let elapsed = now - *waiting_since;
                if elapsed >= *remaining {
                    return false;
                }
                *remaining -= elapsed;
                *waiting_since = now;
            }
        }
    }

    /// Bounded spin phase, entered holding one spin slot. Returns true if the
    /// mutex was acquired; otherwise the spin slot has been converted into a
    /// sleep slot and the caller must park.
    fn spin(&self, fail_at_entry: usize) -> bool {
        debug_assert!(fail_at_entry < SPIN_FAIL_THRESHOLD);
        let budget = (SPIN_FAIL_THRESHOLD - fail_at_entry) * (MAX_SPIN_ITERATIONS / NSPIN_MAX);

        for _ in 0..budget {
            // A bare pause is not enough for the reload below to observe a
            // concurrent release promptly; the full fence is load-bearing.
            spin_loop();
            fence(Ordering::SeqCst);

            let old = State::unpack(self.state.load(Ordering::Acquire));
            if old.locked {
                continue;
            }

            // The mutex is free: take it and give back the spin slot.
            let mut new = old;
            new.locked = true;
            debug_assert!(old.nspin != 0);
            new.nspin = (old.nspin - 1) & NSPIN_MAX;
            if old.nspin_fail != 0 {
                new.nspin_fail = (old.nspin_fail - 1) & NSPIN_MAX;
            }
            if self
                .state
                .compare_exchange(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }

        // Budget exhausted. Give the spin slot back; if the mutex freed up at
        // the last moment take it, otherwise become a sleeper. The sleep slot
        // may only be claimed while the mutex is held: claimed while free, a
        // release that ran before our increment would not wake us.
        let mut old = State::unpack(self.state.load(Ordering::Relaxed));
        loop {
            let mut new = old;
            let acquired = if !old.locked {
                new.locked = true;
                if old.nspin_fail != 0 {
                    new.nspin_fail = (old.nspin_fail - 1) & NSPIN_MAX;
                }
                true
            } else {
                new.nsleep = (old.nsleep + 1) & NSLEEP_MASK;
                // Spinning ran out of budget, so the failure counter grows.
                if old.nspin_fail != NSPIN_MAX {
                    new.nspin_fail = (old.nspin_fail + 1) & NSPIN_MAX;
                }
                false
            };
            debug_assert!(old.nspin != 0);
            new.nspin = (old.nspin - 1) & NSPIN_MAX;
            match self.state.compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return acquired,
                Err(current) => old = State::unpack(current),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{State, Timeout, NSPIN_MAX, SPIN_FAIL_THRESHOLD};
    use crate::lock_imp::{RawMutex as _, RawMutexTimed as _};
    use crate::RawMutex;

    fn unpack(mutex: &RawMutex) -> State {
        State::unpack(mutex.state.load(Ordering::Relaxed))
    }

    fn store(mutex: &RawMutex, state: State) {
        mutex.state.store(state.pack(), Ordering::Relaxed);
    }

    const UNLOCKED: State = State {
        locked: false,
        nspin: 0,
        nsleep: 0,
        nspin_fail: 0,
    };

    #[test]
    fn zero_word_is_unlocked() {
        assert_eq!(State::unpack(0), UNLOCKED);
        assert_eq!(UNLOCKED.pack(), 0);
    }

    #[test]
    fn fields_do_not_bleed_into_each_other() {
        let state = State {
            locked: true,
            nspin: NSPIN_MAX,
            nsleep: 1,
            nspin_fail: NSPIN_MAX,
        };
        assert_eq!(State::unpack(state.pack()), state);

        let state = State {
            locked: false,
            nspin: 0,
            nsleep: 2047,
            nspin_fail: 0,
        };
        assert_eq!(State::unpack(state.pack()), state);
    }

    #[test]
    fn uncontended_lock_unlock_leaves_state_zeroed() {
        let mutex = RawMutex::INIT;
        for _ in 0..1_000_000 {
            mutex.lock();
            unsafe { mutex.unlock() };
        }
        assert_eq!(mutex.state.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fast_path_leaves_counters_untouched() {
        let mutex = RawMutex::INIT;
        store(
            &mutex,
            State {
                locked: false,
                nspin: 3,
                nsleep: 2,
                nspin_fail: 5,
            },
        );

        assert!(mutex.try_lock());
        let state = unpack(&mutex);
        assert!(state.locked);
        assert_eq!(state.nspin, 3);
        assert_eq!(state.nsleep, 2);
        assert_eq!(state.nspin_fail, 5);
    }

    #[test]
    fn contended_try_lock_fails() {
        let mutex = RawMutex::INIT;
        mutex.lock();
        assert!(!mutex.try_lock());
        unsafe { mutex.unlock() };
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
    }

    #[test]
    fn slow_acquire_earns_back_spin_credit() {
        let mutex = RawMutex::INIT;
        store(
            &mutex,
            State {
                nspin_fail: 5,
                ..UNLOCKED
            },
        );

        assert!(mutex.lock_slow(Timeout::Infinite));
        assert_eq!(unpack(&mutex).nspin_fail, 4);
        unsafe { mutex.unlock() };
    }

    #[test]
    fn saturated_failure_counter_sends_contenders_to_sleep() {
        let mutex = Arc::new(RawMutex::INIT);
        store(
            &mutex,
            State {
                locked: true,
                nspin_fail: SPIN_FAIL_THRESHOLD,
                ..UNLOCKED
            },
        );

        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock_for(Duration::from_millis(400)))
        };

        // The contender must register as a sleeper without ever taking a spin
        // slot.
        let mut observed_sleeper = false;
        for _ in 0..400 {
            let state = unpack(&mutex);
            assert_eq!(state.nspin, 0);
            if state.nsleep == 1 {
                observed_sleeper = true;
                assert!(state.nspin_fail > SPIN_FAIL_THRESHOLD);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(observed_sleeper);

        assert!(!contender.join().unwrap());
        let state = unpack(&mutex);
        assert_eq!(state.nsleep, 0);
        assert!(state.locked);
    }

    #[test]
    fn failure_counter_saturates() {
        let mutex = Arc::new(RawMutex::INIT);
        store(
            &mutex,
            State {
                locked: true,
                nspin_fail: NSPIN_MAX,
                ..UNLOCKED
            },
        );

        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock_for(Duration::from_millis(200)))
        };

        assert!(!contender.join().unwrap());
        // The straight-to-sleep registration must not wrap the saturated
        // counter.
        assert_eq!(unpack(&mutex).nspin_fail, NSPIN_MAX);
    }

    #[test]
    fn timed_out_sleeper_hands_back_its_slot() {
        let mutex = Arc::new(RawMutex::INIT);
        mutex.lock();

        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock_for(Duration::from_millis(100)))
        };
        assert!(!contender.join().unwrap());

        let state = unpack(&mutex);
        assert_eq!(state.nsleep, 0);
        assert_eq!(state.nspin, 0);

        unsafe { mutex.unlock() };
        assert_eq!(unpack(&mutex).nsleep, 0);
    }

    #[test]
    fn release_hands_wake_to_parked_contender() {
        let mutex = Arc::new(RawMutex::INIT);
        mutex.lock();

        let acquired = Arc::new(AtomicUsize::new(0));
        let contender = {
            let mutex = Arc::clone(&mutex);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                mutex.lock();
                acquired.store(1, Ordering::SeqCst);
                unsafe { mutex.unlock() };
            })
        };

        // Give the contender time to park.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        unsafe { mutex.unlock() };
        contender.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(mutex.state.load(Ordering::Relaxed), 0);
    }
}
