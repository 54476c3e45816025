//! A fair, sleeping mutex that can hand its lock directly to a chosen thread.
//!
//! See the documentation for the [`Mutex`] type for details.

use crate::{
    blocking::{self, RawMutex},
    loom::{
        cell::{MutPtr, UnsafeCell},
        sync::atomic::{AtomicBool, Ordering::*},
    },
    rt::Runtime,
    spin::Spinlock,
    util::fmt,
    wait_record::WaitRecord,
};
use cordyceps::List;
use core::{
    ops::{Deref, DerefMut},
    pin::pin,
    ptr::NonNull,
};


/// A mutual exclusion lock that blocks contending threads through the
/// [`Runtime`] instead of spinning.
///
/// Ownership is handed off directly: when a contended owner unlocks, the
/// oldest sleeping claimant becomes the owner *before* it is woken, so
/// claimants acquire the lock in FIFO order and a wakeup is never wasted on a
/// thread that then loses a race for the lock bit.
///
/// The same handoff machinery is what [`Condvar`] uses for *wait morphing*: a
/// signaller may enqueue a waiter's [`WaitRecord`] as a lock claimant
/// (`send_lock`), transferring ownership to that waiter without waking it to
/// contend, and the waiter then asserts its ownership with
/// [`receive_lock`](Mutex::receive_lock).
///
/// The queue of claimants is guarded by a [`blocking::Mutex`]; the `Lock`
/// type parameter selects its [`RawMutex`] implementation.
///
/// # Examples
///
/// ```
/// use enoki_sync::{rt::StdRuntime, Mutex};
///
/// let lock = Mutex::<_, StdRuntime>::new(1);
/// *lock.lock() += 1;
/// assert_eq!(*lock.lock(), 2);
/// ```
///
/// [`Condvar`]: crate::Condvar
pub struct Mutex<T, R: Runtime, Lock: RawMutex = Spinlock> {
    raw: Raw<R, Lock>,
    data: UnsafeCell<T>,
}

/// The lock state and claimant queue of a [`Mutex`], independent of the data
/// it protects.
///
/// A [`Condvar`](crate::Condvar) remembers its waiters' user mutex as a
/// pointer to this type, so the wake paths can transfer ownership without
/// knowing the mutex's data type.
pub(crate) struct Raw<R: Runtime, Lock = Spinlock> {
    /// Set while some thread owns the mutex.
    ///
    /// A contended `unlock` does *not* clear this bit: it pops the oldest
    /// claimant and wakes it as the new owner, so the lock never becomes
    /// observably free in between.
    locked: AtomicBool,

    /// Threads sleeping for ownership: contended [`lock`](Mutex::lock)
    /// callers, and wait records transferred in by [`send_lock`](Raw::send_lock).
    queue: blocking::Mutex<List<WaitRecord<R>>, Lock>,
}

/// An RAII guard providing access to the data protected by a [`Mutex`].
///
/// The lock is released (or handed to the oldest claimant) when this guard is
/// dropped.
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T, R: Runtime, Lock: RawMutex = Spinlock> {
    ptr: MutPtr<T>,
    mutex: &'a Mutex<T, R, Lock>,
}

// === impl Mutex ===

impl<T, R: Runtime> Mutex<T, R> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, in the
        /// unlocked state.
        #[must_use]
        pub fn new(data: T) -> Self {
            Self::new_with_raw_mutex(data, Spinlock::new())
        }
    }
}

impl<T, R: Runtime, Lock: RawMutex> Mutex<T, R, Lock> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, using `lock`
        /// as the [`RawMutex`] guarding the claimant queue.
        #[must_use]
        pub fn new_with_raw_mutex(data: T, lock: Lock) -> Self {
            Self {
                raw: Raw::new(lock),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Acquires the mutex, sleeping through the [`Runtime`] until it is
    /// available.
    pub fn lock(&self) -> MutexGuard<'_, T, R, Lock> {
        trace!(mutex = ?fmt::ptr(self), "Mutex::lock");
        self.raw.lock();
        self.guard()
    }

    /// Attempts to acquire the mutex without sleeping.
    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R, Lock>> {
        if self.raw.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// The mutable borrow statically guarantees no lock owner exists, so no
    /// locking takes place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: the exclusive borrow of `self` means the data cannot be
            // aliased.
            self.data.with_mut(|data| &mut *data)
        }
    }

    /// Consumes this `Mutex`, returning the guarded data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub(crate) fn raw(&self) -> &Raw<R, Lock> {
        &self.raw
    }

    fn guard(&self) -> MutexGuard<'_, T, R, Lock> {
        MutexGuard {
            ptr: self.data.get_mut(),
            mutex: self,
        }
    }
}

feature! {
    #![feature = "wait-morphing"]

    impl<T, R: Runtime, Lock: RawMutex> Mutex<T, R, Lock> {
        /// Asserts ownership of a lock that was transferred to the calling
        /// thread, returning its guard without contending.
        ///
        /// When a lock transfer lands, the recipient's [`WaitRecord`] is
        /// flagged woken and the recipient already owns the mutex; this
        /// method only updates the calling thread's bookkeeping. It never
        /// blocks.
        ///
        /// # Safety
        ///
        /// The calling thread must have been made the owner of this mutex by
        /// a completed lock transfer that it has not yet asserted: its wait
        /// record was enqueued as a claimant and has been flagged woken.
        pub unsafe fn receive_lock(&self) -> MutexGuard<'_, T, R, Lock> {
            trace!(mutex = ?fmt::ptr(self), "Mutex::receive_lock");
            debug_assert!(
                self.raw.is_locked(),
                "a completed lock transfer must precede `receive_lock`"
            );
            self.guard()
        }
    }
}

impl<T, R, Lock> fmt::Debug for Mutex<T, R, Lock>
where
    T: fmt::Debug,
    R: Runtime,
    Lock: RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("data", &fmt::opt(&self.try_lock()).or_else("<locked>"))
            .finish_non_exhaustive()
    }
}

/// Safety: as for any lock, sharing a `Mutex` hands `&mut T` out across
/// threads, so `T` must be `Send` for either.
unsafe impl<T: Send, R: Runtime, Lock: RawMutex> Send for Mutex<T, R, Lock> {}
unsafe impl<T: Send, R: Runtime, Lock: RawMutex> Sync for Mutex<T, R, Lock> {}

// === impl Raw ===

impl<R: Runtime, Lock: RawMutex> Raw<R, Lock> {
    loom_const_fn! {
        fn new(lock: Lock) -> Self {
            Self {
                locked: AtomicBool::new(false),
                queue: blocking::Mutex::new_with_raw_mutex(List::new(), lock),
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok()
    }

    #[inline]
    fn lock(&self) {
        if !self.try_lock() {
            self.lock_slow();
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let record = pin!(WaitRecord::<R>::new(R::current()));
        let ptr = NonNull::from(&*record);
        let queued = self.queue.with_lock(|queue| {
            // Re-try under the queue lock. `unlock` decides between clearing
            // the lock bit and handing off while holding this lock, so a
            // claimant that enqueues here cannot miss its wakeup.
            if self.try_lock() {
                return false;
            }
            queue.push_back(ptr);
            true
        });
        if queued {
            record.wait(None);
            // Ownership was handed to this thread before the wake; there is
            // nothing to acquire.
            debug_assert!(record.woken());
            debug_assert!(self.is_locked());
        }
    }

    /// # Safety
    ///
    /// May only be called by the current lock owner.
    unsafe fn unlock(&self) {
        let next = self.queue.with_lock(|queue| {
            let next = queue.pop_front();
            if next.is_none() {
                self.locked.store(false, Release);
            }
            next
        });
        if let Some(wr) = next {
            trace!(record = ?wr, "Mutex: handing off lock");
            // Safety: the record is detached, and its thread is still
            // sleeping on it (it cannot return from its wait until the wake
            // below lands).
            unsafe { wr.as_ref().wake() }
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

feature! {
    #![feature = "wait-morphing"]

    impl<R: Runtime, Lock: RawMutex> Raw<R, Lock> {
        /// Transfers ownership of this mutex to `wr`'s thread, without that
        /// thread contending for the lock.
        ///
        /// If the mutex is free, the transfer completes immediately;
        /// otherwise `wr` joins the claimant queue and a later `unlock` will
        /// complete it. Either way, `wr` is flagged woken exactly when its
        /// thread owns the mutex.
        ///
        /// # Safety
        ///
        /// `wr` must be detached from any other queue, must not have been
        /// woken, and must remain valid until its wake lands (the condvar
        /// protocol guarantees this: a waiter never invalidates its record
        /// before observing `woken`).
        pub(crate) unsafe fn send_lock(&self, wr: NonNull<WaitRecord<R>>) {
            let handed = self.queue.with_lock(|queue| {
                if self.try_lock() {
                    return true;
                }
                queue.push_back(wr);
                false
            });
            if handed {
                trace!(record = ?wr, "Mutex: lock was free, completing transfer");
                // Safety: per this method's contract, the record is valid
                // until this wake lands.
                unsafe { wr.as_ref().wake() }
            }
        }
    }
}

// === impl MutexGuard ===

impl<'a, T, R: Runtime, Lock: RawMutex> MutexGuard<'a, T, R, Lock> {
    /// Returns a reference to the mutex this guard is holding.
    ///
    /// The reference carries the guard's original borrow, so it can be used
    /// to re-acquire the lock after the guard has been consumed; this is how
    /// [`Condvar::wait`](crate::Condvar::wait) gets the mutex back after
    /// sleeping.
    #[inline]
    #[must_use]
    pub fn mutex(&self) -> &'a Mutex<T, R, Lock> {
        self.mutex
    }
}

impl<T, R: Runtime, Lock: RawMutex> Deref for MutexGuard<'_, T, R, Lock> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference
            // the mut pointer.
            &*self.ptr.deref()
        }
    }
}

impl<T, R: Runtime, Lock: RawMutex> DerefMut for MutexGuard<'_, T, R, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference
            // the mut pointer.
            self.ptr.deref()
        }
    }
}

impl<T, R: Runtime, Lock: RawMutex> Drop for MutexGuard<'_, T, R, Lock> {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            // Safety: this guard was only constructed by a successful
            // acquisition or a completed lock transfer.
            self.mutex.raw.unlock()
        }
    }
}

impl<T: fmt::Debug, R: Runtime, Lock: RawMutex> fmt::Debug for MutexGuard<'_, T, R, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
