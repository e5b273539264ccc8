// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')

use core::{
    ffi,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};
use windows::Win32::{
    Foundation::{GetLastError, ERROR_TIMEOUT},
    System::{
        Threading::{Sleep, WaitOnAddress, WakeByAddressSingle},
        WindowsProgramming::INFINITE,
    },
};

use crate::time::Instant;

/// Yield the rest of the current timeslice to the OS.
#[inline]
pub fn thread_yield() {
    unsafe {
        // We don't use SwitchToThread here because it doesn't consider all
        // threads in the system and the thread we are waiting for may not get
        // selected.
        Sleep(0);
    }
}

/// Puts a thread to sleep until some other thread wakes it, built on the
/// `WaitOnAddress` facility.
///
/// The `key` holds 1 while a park is pending and 0 once the thread has been
/// released; kernel-level waits can return spuriously, so every wait re-checks
/// the key.
pub struct ThreadParker {
    key: AtomicUsize,
}

impl ThreadParker {
    #[inline]
    pub const fn new() -> ThreadParker {
        ThreadParker {
            key: AtomicUsize::new(0),
        }
    }

    /// Prepares the parker. This should be called before adding the thread to
    /// a wait queue.
    #[inline]
    pub fn prepare_park(&self) {
        self.key.store(1, Ordering::Relaxed);
    }

    /// Checks whether the park actually timed out. This should be called while
    /// holding the queue lock after `park_until` has returned false.
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.key.load(Ordering::Relaxed) != 0
    }

    /// Parks the thread until it is unparked. This should be called after the
    /// thread has been enqueued, after unlocking the queue.
    #[inline]
    pub unsafe fn park(&self) {
        while self.key.load(Ordering::Acquire) != 0 {
            let r = self.wait_on_address(INFINITE);
            debug_assert!(r);
        }
    }

    /// Parks the thread until it is unparked or `deadline` is reached. Returns
    /// true if the thread was unparked and false if the wait timed out.
    #[inline]
    pub unsafe fn park_until(&self, deadline: Instant) -> bool {
        while self.key.load(Ordering::Acquire) != 0 {
            let now = Instant::now();
            if deadline <= now {
                return false;
            }

            let diff = deadline - now;
            let timeout = diff
                .as_secs()
                .checked_mul(1000)
                .and_then(|x| x.checked_add((diff.subsec_nanos() as u64 + 999_999) / 1_000_000))
                .map(|ms| {
                    if ms > u32::MAX as u64 {
                        INFINITE
                    } else {
                        ms as u32
                    }
                })
                .unwrap_or(INFINITE);

            if !self.wait_on_address(timeout) {
                debug_assert_eq!(unsafe { GetLastError() }, ERROR_TIMEOUT);
            }
        }
        true
    }

    /// Marks the thread as unparked while the queue lock is still held; the
    /// actual wake is issued through the returned handle after the queue lock
    /// has been released.
    #[inline]
    pub unsafe fn unpark_lock(&self) -> UnparkHandle {
        // No lock to take here, just clear the key.
        self.key.store(0, Ordering::Release);

        UnparkHandle {
            key: &self.key as *const _,
        }
    }

    fn wait_on_address(&self, timeout: u32) -> bool {
        let cmp = 1usize;
        unsafe {
            WaitOnAddress(
                &self.key as *const _ as *mut ffi::c_void,
                &cmp as *const _ as *mut ffi::c_void,
                mem::size_of::<usize>(),
                timeout,
            )
            .as_bool()
        }
    }
}

/// Handle for a thread that is about to be unparked. The thread is marked as
/// released while the queue lock is held, but the wake syscall is delayed
/// until after the lock is dropped.
pub struct UnparkHandle {
    key: *const AtomicUsize,
}

impl UnparkHandle {
    /// Wakes up the parked thread. This should be called after the queue lock
    /// is released to avoid holding it across a syscall.
    #[inline]
    pub fn unpark(self) {
        unsafe { WakeByAddressSingle(self.key as *mut ffi::c_void) };
    }
}
