// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')
//! Low-level support for building synchronization primitives.
//!
//! # The parking lot
//!
//! To keep primitives word-sized, all thread queueing and suspension is
//! offloaded to the *parking lot*: a process-wide hash table mapping lock
//! addresses to queues of sleeping threads, in the tradition of WebKit's
//! `WTF::ParkingLot` and Linux futexes.
//!
//! Two operations are exposed:
//!
//! - [`park`] suspends the calling thread and enqueues it on the queue keyed
//!   by an address, until it is released or an optional deadline passes.
//! - [`unpark_one`] releases at most one thread from the queue keyed by an
//!   address. When no thread is queued there yet, the wake is recorded and
//!   handed to the next thread that parks on the address, so a release can
//!   never slip between a waiter announcing itself and actually sleeping.
//!
//! Addresses are opaque: park and unpark match on the address value alone, so
//! callers must only use addresses they control.

mod parking_lot;
mod spin_wait;
mod word_lock;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use crate::os::windows::sync as imp;
    } else {
        use crate::os::generic::sync as imp;
    }
}

pub use self::parking_lot::{park, unpark_one, ParkResult};
pub use self::spin_wait::SpinWait;
