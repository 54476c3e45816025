//! The internal blocking mutex guarding this crate's queues.
//!
//! Every queue in this crate (a condvar's waiter FIFO, a mutex's queue of
//! lock claimants) is mutated only inside a short critical section of a
//! [`Mutex`]. By default the underlying lock is a [`Spinlock`]; a runtime may
//! substitute any [`RawMutex`] implementation (for instance, one that also
//! masks interrupts on the local CPU) through the `new_with_raw_mutex`
//! constructors on this crate's types.

use crate::{
    loom::cell::{MutPtr, UnsafeCell},
    spin::Spinlock,
    util::fmt,
};
use core::ops::{Deref, DerefMut};

/// Trait abstracting over raw blocking mutex implementations.
///
/// # Safety
///
/// Implementations must be mutually exclusive: [`lock`](Self::lock) may not
/// return, and [`try_lock`](Self::try_lock) may not return `true`, while
/// another lock owner exists.
pub unsafe trait RawMutex {
    /// Acquires the mutex, blocking the current thread or CPU core until it
    /// is able to do so.
    fn lock(&self);

    /// Attempts to acquire the mutex without blocking. Returns `true` if it
    /// was acquired and `false` otherwise.
    fn try_lock(&self) -> bool;

    /// Unlocks the mutex.
    ///
    /// # Safety
    ///
    /// This may only be called by the current lock owner, i.e. it must be
    /// paired with a successful [`lock`](Self::lock) or
    /// [`try_lock`](Self::try_lock).
    unsafe fn unlock(&self);

    /// Returns `true` if the mutex is currently locked.
    fn is_locked(&self) -> bool;
}

/// A blocking mutual exclusion lock for protecting shared data.
///
/// Unlike the [user-facing `Mutex`](crate::mutex::Mutex), this lock never
/// sleeps through the scheduler: the raw `Lock` blocks the CPU (by default,
/// by spinning). It is meant for the O(1) critical sections that guard this
/// crate's queues, and is exposed so that runtimes building on `enoki-sync`
/// can guard their own short critical sections the same way.
pub struct Mutex<T, Lock = Spinlock> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII guard for a [`Mutex`]; the lock is released when it is dropped.
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T, Lock: RawMutex = Spinlock> {
    ptr: MutPtr<T>,
    lock: &'a Lock,
}

// === impl Mutex ===

impl<T> Mutex<T> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, using a
        /// [`Spinlock`] as the raw mutex implementation.
        #[must_use]
        pub fn new(data: T) -> Self {
            Self::new_with_raw_mutex(data, Spinlock::new())
        }
    }
}

impl<T, Lock> Mutex<T, Lock> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, using `lock`
        /// as the [`RawMutex`] implementation.
        #[must_use]
        pub fn new_with_raw_mutex(data: T, lock: Lock) -> Self {
            Self {
                lock,
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock: RawMutex> Mutex<T, Lock> {
    /// Locks the mutex, invokes `f` on the guarded data, and unlocks it
    /// again.
    ///
    /// The lock is released when `f` returns, including by panic, so a
    /// panicking closure cannot leave the lock held.
    #[cfg_attr(test, track_caller)]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut *guard)
    }

    /// Acquires the mutex, blocking until it is available.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T, Lock> {
        self.lock.lock();
        self.guard()
    }

    /// Attempts to acquire the mutex without blocking.
    #[must_use]
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, Lock>> {
        if self.lock.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// The mutable borrow statically guarantees no other lock owner exists,
    /// so no locking takes place.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: the exclusive borrow of `self` means the data cannot be
            // aliased.
            self.data.with_mut(|data| &mut *data)
        }
    }

    fn guard(&self) -> MutexGuard<'_, T, Lock> {
        MutexGuard {
            ptr: self.data.get_mut(),
            lock: &self.lock,
        }
    }
}

impl<T: Default, Lock: Default> Default for Mutex<T, Lock> {
    fn default() -> Self {
        Self {
            lock: Default::default(),
            data: UnsafeCell::new(Default::default()),
        }
    }
}

impl<T, Lock> fmt::Debug for Mutex<T, Lock>
where
    T: fmt::Debug,
    Lock: fmt::Debug + RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("data", &fmt::opt(&self.try_lock()).or_else("<locked>"))
            .field("lock", &self.lock)
            .finish()
    }
}

unsafe impl<T: Send, Lock> Send for Mutex<T, Lock> {}
unsafe impl<T: Send, Lock> Sync for Mutex<T, Lock> {}

// === impl MutexGuard ===

impl<T, Lock: RawMutex> Deref for MutexGuard<'_, T, Lock> {
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

impl<T, Lock: RawMutex> DerefMut for MutexGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference
            // the mut pointer.
            self.ptr.deref()
        }
    }
}

impl<T, Lock: RawMutex> Drop for MutexGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe {
            // Safety: this guard was only constructed by a successful lock
            // acquisition.
            self.lock.unlock()
        }
    }
}

impl<T: fmt::Debug, Lock: RawMutex> fmt::Debug for MutexGuard<'_, T, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
