// Portions of the project have been copied from parking_lot and is copyrighted by Amanieu d'Antra under the MIT license (located in: '3rd-party-licenses/parking_lot')
use core::{
    cell::{Cell, UnsafeCell},
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use smallvec::SmallVec;

use super::{imp::ThreadParker, word_lock::WordLock};
use crate::time::Instant;

/// Number of live threads that have ever touched the parking lot; the table
/// is sized from this.
static NUM_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Holds the pointer to the currently active `HashTable`.
///
/// # Safety
///
/// Except for the initial value of null, it must always point to a valid
/// `HashTable` instance. Any `HashTable` this global static has ever pointed
/// to must never be freed.
static HASHTABLE: AtomicPtr<HashTable> = AtomicPtr::new(ptr::null_mut());

// Even with 3x more buckets than threads, the memory overhead per thread is
// still only a few hundred bytes.
const LOAD_FACTOR: usize = 3;

struct HashTable {
    /// Hash buckets for the table.
    entries: Box<[Bucket]>,

    /// Number of bits used for the hash function.
    hash_bits: u32,

    /// Previous table. This is only kept to keep leak detectors happy.
    _prev: *const HashTable,
}

impl HashTable {
    #[inline]
    fn new(num_threads: usize, prev: *const HashTable) -> Box<HashTable> {
        let new_size = (num_threads * LOAD_FACTOR).next_power_of_two();
        let hash_bits = 0usize.leading_zeros() - new_size.leading_zeros() - 1;

        let mut entries = Vec::with_capacity(new_size);
        for _ in 0..new_size {
            entries.push(Bucket::new());
        }

        Box::new(HashTable {
            entries: entries.into_boxed_slice(),
            hash_bits,
            _prev: prev,
        })
    }
}

/// A wake posted for a key no thread was parked on yet. The waiter it is
/// addressed to is already committed to parking (or to polling for exactly
/// this wake) and claims it at park entry.
struct PendingWake {
    key: usize,
    count: u32,
}

struct Bucket {
    /// Lock protecting the queue and the pending wakes.
    mutex: WordLock,

    /// Linked list of threads waiting on this bucket.
    queue_head: Cell<*const ThreadData>,
    queue_tail: Cell<*const ThreadData>,

    /// Wakes that arrived before their waiter; only touched under `mutex`.
    pending_wakes: UnsafeCell<SmallVec<[PendingWake; 4]>>,
}

impl Bucket {
    #[inline]
    fn new() -> Self {
        Self {
            mutex: WordLock::new(),
            queue_head: Cell::new(ptr::null()),
            queue_tail: Cell::new(ptr::null()),
            pending_wakes: UnsafeCell::new(SmallVec::new()),
        }
    }
}

struct ThreadData {
    parker: ThreadParker,

    /// Key this thread is sleeping on.
    key: AtomicUsize,

    /// Linked list of parked threads in a bucket.
    next_in_queue: Cell<*const ThreadData>,
}

impl ThreadData {
    fn new() -> ThreadData {
        // Keep track of the total number of live `ThreadData` objects and
        // resize the hash table accordingly.
        let num_threads = NUM_THREADS.fetch_add(1, Ordering::Relaxed) + 1;
        grow_hashtable(num_threads);

        ThreadData {
            parker: ThreadParker::new(),
            key: AtomicUsize::new(0),
            next_in_queue: Cell::new(ptr::null()),
        }
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        NUM_THREADS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Invokes the given closure with a reference to the current thread's
/// `ThreadData`.
#[inline(always)]
fn with_thread_data<T>(f: impl FnOnce(&ThreadData) -> T) -> T {
    // Try to read from a thread-local; during TLS destruction fall back to a
    // `ThreadData` on the stack instead.
    let mut thread_data_storage = None;
    thread_local!(static THREAD_DATA: ThreadData = ThreadData::new());
    let thread_data_ptr = THREAD_DATA
        .try_with(|x| x as *const ThreadData)
        .unwrap_or_else(|_| thread_data_storage.get_or_insert_with(ThreadData::new));

    f(unsafe { &*thread_data_ptr })
}

/// Returns a reference to the latest hash table, creating one if it doesn't
/// exist yet. The reference is valid forever, though the table it points to
/// may stop being the instance in active use at any moment.
#[inline]
fn get_hashtable() -> &'static HashTable {
    let table = HASHTABLE.load(Ordering::Acquire);

    if table.is_null() {
        create_hashtable()
    } else {
        // SAFETY: when not null, `HASHTABLE` always points to a `HashTable`
        // that is never freed.
        unsafe { &*table }
    }
}

#[cold]
fn create_hashtable() -> &'static HashTable {
    let new_table = Box::into_raw(HashTable::new(LOAD_FACTOR, ptr::null()));

    // If this fails it means some other thread created the table first.
    match HASHTABLE.compare_exchange(
        ptr::null_mut(),
        new_table,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        // SAFETY: the pointer we published is never freed.
        Ok(_) => unsafe { &*new_table },
        Err(old_table) => {
            // Free the table we raced to create.
            // SAFETY: `new_table` was created above and never shared.
            drop(unsafe { Box::from_raw(new_table) });
            // SAFETY: the table loaded from `HASHTABLE` is never freed.
            unsafe { &*old_table }
        }
    }
}

/// Grows the hash table so that it is big enough for the given number of
/// threads. Only done when a `ThreadData` is created, which happens once per
/// thread.
fn grow_hashtable(num_threads: usize) {
    // Lock all buckets in the existing table and get a reference to it.
    let old_table = loop {
        let table = get_hashtable();

        if table.entries.len() >= LOAD_FACTOR * num_threads {
            return;
        }

        for bucket in &table.entries[..] {
            bucket.mutex.lock();
        }

        // Another thread could have grown the table between us reading
        // `HASHTABLE` and locking the buckets.
        if HASHTABLE.load(Ordering::Relaxed) == table as *const _ as *mut _ {
            break table;
        }

        // Unlock the buckets and try again.
        for bucket in &table.entries[..] {
            // SAFETY: we hold the lock here, as required
            unsafe { bucket.mutex.unlock() };
        }
    };

    let new_table = Box::into_raw(HashTable::new(num_threads, old_table));

    // Move the entries from the old table to the new one. No parker can be
    // touched concurrently: every park and unpark path locks its bucket, and
    // we hold all of them.
    for bucket in &old_table.entries[..] {
        // SAFETY: the queue lists only contain `ThreadData` instances that
        // stay valid while their threads are parked, and we hold every bucket
        // lock.
        unsafe { rehash_bucket_into(bucket, &mut *new_table) };
    }

    // Publish the new table. No races are possible at this point because any
    // other thread trying to grow the table is blocked on the bucket locks in
    // the old one.
    HASHTABLE.store(new_table, Ordering::Release);

    for bucket in &old_table.entries[..] {
        // SAFETY: we hold the lock here, as required
        unsafe { bucket.mutex.unlock() };
    }
}

/// Moves every queued thread and every pending wake of `bucket` into the
/// buckets of `table` their keys hash to under the new table's hash.
///
/// # Safety
///
/// `bucket` must hold a correctly constructed linked list under `queue_head`,
/// and both the bucket's lock and all of `table`'s bucket locks must be
/// logically held by the caller (the table is not yet published).
unsafe fn rehash_bucket_into(bucket: &Bucket, table: &mut HashTable) {
    let mut current: *const ThreadData = bucket.queue_head.get();
    while !current.is_null() {
        let next = (*current).next_in_queue.get();
        let hash = hash((*current).key.load(Ordering::Relaxed), table.hash_bits);
        if table.entries[hash].queue_tail.get().is_null() {
            table.entries[hash].queue_head.set(current);
        } else {
            (*table.entries[hash].queue_tail.get())
                .next_in_queue
                .set(current);
        }
        table.entries[hash].queue_tail.set(current);
        (*current).next_in_queue.set(ptr::null());
        current = next;
    }

    let pending = &mut *bucket.pending_wakes.get();
    for wake in pending.drain(..) {
        let hash = hash(wake.key, table.hash_bits);
        let dst = &mut *table.entries[hash].pending_wakes.get();
        match dst.iter_mut().find(|w| w.key == wake.key) {
            Some(w) => w.count += wake.count,
            None => dst.push(wake),
        }
    }
}

/// Hash function for addresses.
#[inline]
#[cfg(target_pointer_width = "32")]
fn hash(key: usize, bits: u32) -> usize {
    key.wrapping_mul(0x9E37_79B9) >> (32 - bits)
}

#[inline]
#[cfg(target_pointer_width = "64")]
fn hash(key: usize, bits: u32) -> usize {
    key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - bits)
}

/// Locks the bucket for the given key and returns a reference to it. The
/// returned bucket must be unlocked again in order to not cause deadlocks.
#[inline]
fn lock_bucket(key: usize) -> &'static Bucket {
    loop {
        let hashtable = get_hashtable();

        let hash = hash(key, hashtable.hash_bits);
        let bucket = &hashtable.entries[hash];

        bucket.mutex.lock();

        // If no other thread has rehashed the table while we were waiting for
        // the lock, we are good to go: the lock we hold prevents rehashes.
        if HASHTABLE.load(Ordering::Relaxed) == hashtable as *const _ as *mut _ {
            return bucket;
        }

        // Unlock the bucket and try again.
        // SAFETY: we hold the lock here, as required
        unsafe { bucket.mutex.unlock() }
    }
}

/// Outcome of a [`park`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParkResult {
    /// A wake addressed to this key was consumed, either by being released
    /// from the queue or by claiming a wake that arrived before the park.
    Unparked,

    /// The deadline passed without a wake.
    TimedOut,
}

impl ParkResult {
    /// Returns true if we were woken by another thread.
    #[inline]
    pub fn is_unparked(self) -> bool {
        matches!(self, ParkResult::Unparked)
    }
}

/// Parks the current thread in the queue associated with the given key.
///
/// If a wake has already been posted for `key` it is claimed immediately and
/// the call returns [`ParkResult::Unparked`] without sleeping. Otherwise the
/// thread sleeps until [`unpark_one`] releases it or `deadline` passes; a
/// deadline that has already passed turns the call into a poll that cannot
/// sleep, which timed-out waiters use to drain a wake still in flight.
///
/// # Safety
///
/// You should only call this function with an address that you control, since
/// you could otherwise interfere with the operation of other synchronization
/// primitives.
pub unsafe fn park(key: usize, deadline: Option<Instant>) -> ParkResult {
    with_thread_data(|thread_data| {
        let bucket = lock_bucket(key);

        // A wake posted before we got here counts as being woken.
        let pending = &mut *bucket.pending_wakes.get();
        if let Some(idx) = pending.iter().position(|w| w.key == key) {
            pending[idx].count -= 1;
            if pending[idx].count == 0 {
                pending.swap_remove(idx);
            }
            // SAFETY: we hold the lock here, as required
            bucket.mutex.unlock();
            return ParkResult::Unparked;
        }

        if let Some(deadline) = deadline {
            if deadline <= Instant::now() {
                // SAFETY: we hold the lock here, as required
                bucket.mutex.unlock();
                return ParkResult::TimedOut;
            }
        }

        // Append our thread data to the queue and unlock the bucket.
        thread_data.next_in_queue.set(ptr::null());
        thread_data.key.store(key, Ordering::Relaxed);
        thread_data.parker.prepare_park();
        if !bucket.queue_head.get().is_null() {
            (*bucket.queue_tail.get()).next_in_queue.set(thread_data);
        } else {
            bucket.queue_head.set(thread_data);
        }
        // SAFETY: we hold the lock here, as required
        bucket.mutex.unlock();

        // Sleep until we are woken up by an unpark or by our deadline. Note
        // that this check isn't precise: we can still be released while
        // observing the timeout, since we are still in the queue.
        let unparked = match deadline {
            Some(deadline) => thread_data.parker.park_until(deadline),
            None => {
                thread_data.parker.park();
                true
            }
        };

        if unparked {
            return ParkResult::Unparked;
        }

        // Lock our bucket again. Note that the hashtable may have been
        // rehashed in the meantime.
        let bucket = lock_bucket(key);

        // Now re-check precisely: an unparker may have dequeued us between the
        // kernel-level timeout and this point, in which case the wake is ours.
        if !thread_data.parker.timed_out() {
            // SAFETY: we hold the lock here, as required
            bucket.mutex.unlock();
            return ParkResult::Unparked;
        }

        // We timed out, so we need to remove our thread from the queue.
        let mut link = &bucket.queue_head;
        let mut current = bucket.queue_head.get();
        let mut previous = ptr::null();
        while !current.is_null() {
            if ptr::eq(current, thread_data) {
                let next = (*current).next_in_queue.get();
                link.set(next);
                if bucket.queue_tail.get() == current {
                    bucket.queue_tail.set(previous);
                }
                break;
            }
            link = &(*current).next_in_queue;
            previous = current;
            current = link.get();
        }

        // There is no way for our thread to have left the queue if the parker
        // still reports a timeout.
        debug_assert!(!current.is_null());

        // SAFETY: we hold the lock here, as required
        bucket.mutex.unlock();
        ParkResult::TimedOut
    })
}

/// Releases at most one thread from the queue associated with the given key.
///
/// If no thread is parked on `key` yet, the wake is recorded and claimed by
/// the next thread that parks on it; it is never dropped and never releases
/// more than one thread.
///
/// # Safety
///
/// You should only call this function with an address that you control, since
/// you could otherwise interfere with the operation of other synchronization
/// primitives.
pub unsafe fn unpark_one(key: usize) {
    let bucket = lock_bucket(key);

    // Find a thread with a matching key and remove it from the queue.
    let mut link = &bucket.queue_head;
    let mut current = bucket.queue_head.get();
    let mut previous = ptr::null();
    while !current.is_null() {
        if (*current).key.load(Ordering::Relaxed) == key {
            let next = (*current).next_in_queue.get();
            link.set(next);
            if bucket.queue_tail.get() == current {
                bucket.queue_tail.set(previous);
            }

            // Mark the thread released while the bucket is locked (so a
            // concurrent timeout observes the wake), then unlock before the
            // actual wake syscall.
            let handle = (*current).parker.unpark_lock();
            // SAFETY: we hold the lock here, as required
            bucket.mutex.unlock();
            handle.unpark();
            return;
        }
        link = &(*current).next_in_queue;
        previous = current;
        current = link.get();
    }

    // No thread is parked on this key yet. The wake must not be dropped: the
    // waiter it is addressed to is on its way here and claims it at park
    // entry.
    let pending = &mut *bucket.pending_wakes.get();
    match pending.iter_mut().find(|w| w.key == key) {
        Some(wake) => wake.count += 1,
        None => pending.push(PendingWake { key, count: 1 }),
    }
    // SAFETY: we hold the lock here, as required
    bucket.mutex.unlock();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{park, unpark_one, ParkResult};

    #[test]
    fn pending_wake_is_claimed_by_next_park() {
        let anchor = 0usize;
        let key = &anchor as *const usize as usize;

        unsafe {
            unpark_one(key);
            assert_eq!(park(key, Some(Instant::now())), ParkResult::Unparked);
            assert_eq!(park(key, Some(Instant::now())), ParkResult::TimedOut);
        }
    }

    #[test]
    fn expired_deadline_is_a_poll() {
        let anchor = 0usize;
        let key = &anchor as *const usize as usize;

        let before = Instant::now();
        let result = unsafe { park(key, Some(before)) };
        assert_eq!(result, ParkResult::TimedOut);
        assert!(before.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn park_observes_deadline() {
        let anchor = 0usize;
        let key = &anchor as *const usize as usize;

        let before = Instant::now();
        let result = unsafe { park(key, Some(before + Duration::from_millis(50))) };
        assert_eq!(result, ParkResult::TimedOut);
        assert!(before.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        let shared = Arc::new(AtomicUsize::new(0));
        let key = &*shared as *const AtomicUsize as usize;

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let key = &*shared as *const AtomicUsize as usize;
                let result = unsafe { park(key, None) };
                shared.store(1, Ordering::SeqCst);
                assert!(result.is_unparked());
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(shared.load(Ordering::SeqCst), 0);

        unsafe { unpark_one(key) };
        waiter.join().unwrap();
        assert_eq!(shared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_unpark_releases_one_of_two() {
        let shared = Arc::new((AtomicUsize::new(0), AtomicUsize::new(0)));
        let key = &shared.0 as *const AtomicUsize as usize;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let key = &shared.0 as *const AtomicUsize as usize;
                    assert!(unsafe { park(key, None) }.is_unparked());
                    shared.1.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(200));
        unsafe { unpark_one(key) };
        thread::sleep(Duration::from_millis(200));
        assert_eq!(shared.1.load(Ordering::SeqCst), 1);

        unsafe { unpark_one(key) };
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(shared.1.load(Ordering::SeqCst), 2);
    }
}
