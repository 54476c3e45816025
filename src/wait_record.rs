//! The per-wait rendezvous object linking a waiter thread to its wakeup.
//!
//! See the documentation for the [`WaitRecord`] type for details.

use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, Ordering::*},
    },
    rt::Runtime,
    util::fmt,
};
use cordyceps::{list, Linked};
use core::{
    marker::PhantomPinned,
    ptr::{self, NonNull},
};

/// A single thread's intent to wait for a wakeup.
///
/// A `WaitRecord` is the rendezvous point between one waiting thread and
/// whichever party eventually wakes it: a [`Condvar`] signaller, a [`Mutex`]
/// owner handing the lock over, or nobody (in which case a deadline passed to
/// [`wait`] breaks the sleep). It records the waiting thread's handle and a
/// `woken` flag that is set exactly once per wait.
///
/// Records are allocated on the waiting thread's stack and linked into a
/// queue by reference, so waiting allocates nothing. This also means a record
/// is only valid for the duration of the `wait` call that created it: the
/// queues in this crate are careful never to touch a record after publishing
/// its wakeup, and a waiter never returns while another party may still be
/// holding a reference to its record.
///
/// [`Condvar`]: crate::Condvar
/// [`Mutex`]: crate::Mutex
/// [`wait`]: WaitRecord::wait
#[repr(C)]
pub struct WaitRecord<R: Runtime> {
    /// Linkage into a mutex's queue of lock claimants.
    ///
    /// This must be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    links: list::Links<WaitRecord<R>>,

    /// Link to the next-oldest record in a condvar's waiter FIFO.
    ///
    /// Guarded by that condvar's internal mutex while the record is linked;
    /// owned by the detaching signaller afterwards.
    next: UnsafeCell<Option<NonNull<WaitRecord<R>>>>,

    /// Set once by whichever party completes the wakeup.
    woken: AtomicBool,

    thread: R::Thread,

    _pin: PhantomPinned,
}

// === impl WaitRecord ===

impl<R: Runtime> WaitRecord<R> {
    loom_const_fn! {
        /// Returns a new `WaitRecord` owned by `thread`.
        #[must_use]
        pub fn new(thread: R::Thread) -> Self {
            Self {
                links: list::Links::new(),
                next: UnsafeCell::new(None),
                woken: AtomicBool::new(false),
                thread,
                _pin: PhantomPinned,
            }
        }
    }

    /// Blocks the owning thread until [`wake`](Self::wake) is called, or
    /// until `deadline` (if one is given) has passed.
    ///
    /// Returns immediately if the record was already woken. On return the
    /// caller inspects [`woken`](Self::woken): `false` means the deadline
    /// fired first, and the caller still shares the record with any party
    /// that might be about to wake it.
    ///
    /// May only be called by the thread the record was created with.
    pub fn wait(&self, deadline: Option<R::Instant>) {
        test_debug!(record = ?fmt::ptr(self), ?deadline, "WaitRecord::wait");
        loop {
            if self.woken() {
                return;
            }
            match deadline {
                Some(deadline) => {
                    if R::now() >= deadline {
                        return;
                    }
                    R::park_until(deadline);
                }
                None => R::park(),
            }
        }
    }

    /// Publishes the wakeup and makes the owning thread runnable.
    ///
    /// Each record is woken at most once. Once the flag is published, the
    /// owning thread is free to return from [`wait`](Self::wait) and pop the
    /// record's stack frame, so this method takes everything it needs out of
    /// the record *before* setting the flag and never touches it after.
    pub fn wake(&self) {
        test_debug!(record = ?fmt::ptr(self), "WaitRecord::wake");
        let thread = self.thread.clone();
        let woken = self.woken.swap(true, SeqCst);
        debug_assert!(!woken, "a wait record may be woken at most once");
        R::unpark(&thread);
    }

    /// Returns `true` once [`wake`](Self::wake) has been called on this
    /// record.
    #[inline]
    #[must_use]
    pub fn woken(&self) -> bool {
        self.woken.load(SeqCst)
    }

    /// Returns the handle of the thread this record belongs to.
    #[inline]
    #[must_use]
    pub fn thread(&self) -> &R::Thread {
        &self.thread
    }

    /// # Safety
    ///
    /// The caller must either hold the lock of the FIFO this record is
    /// linked into, or be the signaller that detached it.
    pub(crate) unsafe fn next(&self) -> Option<NonNull<Self>> {
        self.next.with(|next| unsafe { *next })
    }

    /// # Safety
    ///
    /// As for [`next`](Self::next).
    pub(crate) unsafe fn set_next(&self, next: Option<NonNull<Self>>) {
        self.next.with_mut(|ptr| unsafe { *ptr = next })
    }
}

/// Safety: a `WaitRecord` is shared between the waiter thread and at most one
/// waking party. The `woken` flag is atomic; the `next` link and the mutex
/// queue `links` are only accessed with the owning queue's lock held, or by
/// the single party that detached the record from its queue.
unsafe impl<R: Runtime> Send for WaitRecord<R> {}
unsafe impl<R: Runtime> Sync for WaitRecord<R> {}

/// Linkage for the mutex claimant queue ([`cordyceps::List`]).
unsafe impl<R: Runtime> Linked<list::Links<WaitRecord<R>>> for WaitRecord<R> {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<WaitRecord<R>>> {
        // Safety: `links` is the first field of a `repr(C)` struct, so the
        // pointers coincide; using `addr_of_mut!` avoids materializing a
        // temporary reference to the whole record.
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        unsafe { NonNull::new_unchecked(links) }
    }
}

impl<R: Runtime> fmt::Debug for WaitRecord<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitRecord")
            .field("woken", &self.woken())
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}
