// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')

use super::lock_imp;
use super::raw_mutex::RawMutex;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block threads waiting for the lock to become available,
/// first spinning for a short, adaptively sized budget and then parking on
/// the mutex address.
///
/// # Differences from the standard library `Mutex`
///
/// - No poisoning; the lock is released normally on panic.
/// - Only requires one word of space, whereas the standard library `Mutex`
///   may box its platform state.
/// - Can be statically constructed.
/// - Does not require any drop glue when dropped.
/// - Inline fast path for the uncontended case.
/// - Efficient handling of micro-contention using adaptive spinning.
/// - Deadline-bounded acquisition through `try_lock_for` / `try_lock_until`.
///
/// There is no fairness guarantee: a thread that keeps re-acquiring the mutex
/// can starve other waiters indefinitely.
pub type Mutex<T> = lock_imp::Mutex<RawMutex, T>;

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard via its
/// `Deref` and `DerefMut` implementations.
pub type MutexGuard<'a, T> = lock_imp::MutexGuard<'a, RawMutex, T>;
