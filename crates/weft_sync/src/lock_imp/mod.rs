// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')
//! Type-safe `Mutex` wrapping over a raw lock type.
//!
//! This splits a lock into two halves: a *raw* type carrying only the lock
//! state, and a generic wrapper adding RAII guards and data ownership on top.
//! Code built against the wrapper stays generic over raw lock
//! implementations:
//!
//! 1. Create a raw lock type holding only the lock state, not the protected
//!    data.
//! 2. Implement the [`RawMutex`] trait for it (and [`RawMutexTimed`] if it
//!    supports deadlines).
//! 3. Export type aliases for [`Mutex`] and [`MutexGuard`] instantiated with
//!    the raw type; those aliases are what users name.

/// Marker type which indicates that the guard type for a lock is `Send`.
pub struct GuardSend(());

/// Marker type which indicates that the guard type for a lock is not `Send`.
#[allow(dead_code)]
pub struct GuardNoSend(*mut ());

unsafe impl Sync for GuardNoSend {}

mod mutex;
pub use mutex::*;
