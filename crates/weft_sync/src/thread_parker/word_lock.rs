// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')
use core::sync::atomic::{AtomicUsize, Ordering};

use super::imp::thread_yield;
use super::spin_wait::SpinWait;

const LOCKED_BIT: usize = 1;

/// Lock protecting one hash bucket of the parking lot.
///
/// Bucket critical sections are a handful of pointer writes, so contention is
/// resolved by spinning with escalating backoff and timeslice yields rather
/// than by queueing.
pub struct WordLock {
    state: AtomicUsize,
}

impl WordLock {
    #[inline]
    pub const fn new() -> WordLock {
        WordLock {
            state: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spinwait = SpinWait::new();
        loop {
            if self.state.load(Ordering::Relaxed) & LOCKED_BIT == 0
                && self
                    .state
                    .compare_exchange_weak(0, LOCKED_BIT, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            if !spinwait.spin() {
                thread_yield();
            }
        }
    }

    /// # Safety
    ///
    /// The lock must be held by the current thread.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}
