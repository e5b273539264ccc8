//! Blocking synchronization primitives for a threading runtime.
//!
//! The crate is built around two layers:
//!
//! - [`thread_parker`] implements the *parking lot*: a process-wide hash table
//!   mapping addresses to queues of sleeping threads. A thread can park itself
//!   on any address it controls, and another thread can release at most one
//!   waiter per wake on that same address. All queueing and suspension lives
//!   here, so the primitives built on top stay one word in size.
//! - [`RawMutex`] is an adaptive mutex whose entire state is a single atomic
//!   word: a lock bit plus counters tracking how many threads are spinning,
//!   how many are parked, and how often spinning has recently failed to pay
//!   off. Contenders first burn a short, adaptively sized spin budget and only
//!   then pay the kernel-transition cost of parking.
//!
//! The safe surface is [`Mutex`], an RAII wrapper over [`RawMutex`] through
//! the [`lock_imp`] traits, supporting plain, `try`, and deadline-bounded
//! acquisition.
//!
//! There is no fairness guarantee, no recursion, and no ownership tracking: a
//! thread that re-enters a mutex it already holds deadlocks.

pub mod lock_imp;
pub mod thread_parker;
pub mod time;

mod mutex;
mod os;
mod raw_mutex;

pub use mutex::{Mutex, MutexGuard};
pub use raw_mutex::RawMutex;
