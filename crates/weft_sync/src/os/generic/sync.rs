// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')

use std::{
    mem,
    sync::{Condvar, Mutex, MutexGuard},
};

use crate::time::Instant;

/// Yield the rest of the current timeslice to the OS.
#[inline]
pub fn thread_yield() {
    std::thread::yield_now();
}

/// Puts a thread to sleep until some other thread wakes it, built on a
/// mutex/condvar pair.
///
/// `should_park` holds true while a park is pending and false once the thread
/// has been released; condvar waits can return spuriously, so every wait
/// re-checks the flag.
pub struct ThreadParker {
    should_park: Mutex<bool>,
    condvar: Condvar,
}

impl ThreadParker {
    #[inline]
    pub const fn new() -> ThreadParker {
        ThreadParker {
            should_park: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Prepares the parker. This should be called before adding the thread to
    /// a wait queue.
    #[inline]
    pub fn prepare_park(&self) {
        *self.flag() = true;
    }

    /// Checks whether the park actually timed out. This should be called while
    /// holding the queue lock after `park_until` has returned false.
    ///
    /// Taking the flag mutex here is what synchronizes with an unparker that
    /// has already dequeued us: we block until its handle is dropped and then
    /// observe the cleared flag.
    #[inline]
    pub fn timed_out(&self) -> bool {
        *self.flag()
    }

    /// Parks the thread until it is unparked. This should be called after the
    /// thread has been enqueued, after unlocking the queue.
    #[inline]
    pub unsafe fn park(&self) {
        let mut should_park = self.flag();
        while *should_park {
            should_park = self
                .condvar
                .wait(should_park)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Parks the thread until it is unparked or `deadline` is reached. Returns
    /// true if the thread was unparked and false if the wait timed out.
    #[inline]
    pub unsafe fn park_until(&self, deadline: Instant) -> bool {
        let mut should_park = self.flag();
        while *should_park {
            let now = Instant::now();
            if deadline <= now {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(should_park, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            should_park = guard;
        }
        true
    }

    /// Marks the thread as unparked while the queue lock is still held; the
    /// actual wake is issued through the returned handle after the queue lock
    /// has been released.
    ///
    /// The flag mutex stays held by the handle until `unpark` runs, which
    /// keeps the target thread from observing a timeout and tearing down its
    /// queue entry state in the meantime.
    #[inline]
    pub unsafe fn unpark_lock(&self) -> UnparkHandle {
        let mut should_park = self.flag();
        *should_park = false;

        UnparkHandle {
            condvar: &self.condvar as *const _,
            _guard: mem::transmute::<MutexGuard<'_, bool>, MutexGuard<'static, bool>>(should_park),
        }
    }

    #[inline]
    fn flag(&self) -> MutexGuard<'_, bool> {
        // The flag mutex is only ever held for a few instructions, never
        // across a panic, so poisoning cannot occur; recover anyway rather
        // than unwrap.
        self.should_park.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle for a thread that is about to be unparked. The thread is marked as
/// released while the queue lock is held, but the condvar signal is delayed
/// until after the lock is dropped.
pub struct UnparkHandle {
    condvar: *const Condvar,
    _guard: MutexGuard<'static, bool>,
}

impl UnparkHandle {
    /// Wakes up the parked thread. This should be called after the queue lock
    /// is released to avoid holding it across the wake.
    #[inline]
    pub fn unpark(self) {
        // Signal while the flag mutex is still held (it drops with self);
        // notifying after the drop would race with the target thread exiting
        // and freeing the parker.
        unsafe { (*self.condvar).notify_one() };
    }
}
