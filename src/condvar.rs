//! A condition variable for kernel-class preemptive threads, with wait
//! morphing.
//!
//! See the documentation for the [`Condvar`] type for details.

use crate::{
    blocking::{self, RawMutex},
    loom::sync::atomic::{AtomicUsize, Ordering::*},
    mutex::MutexGuard,
    rt::Runtime,
    spin::Spinlock,
    util::{fmt, CachePadded},
    wait_record::WaitRecord,
    WaitTimeoutResult,
};
use core::{pin::pin, ptr::NonNull};

#[cfg(feature = "wait-morphing")]
use crate::mutex::Raw;
#[cfg(not(feature = "wait-morphing"))]
use core::marker::PhantomData;

#[cfg(test)]
mod tests;

/// A condition variable: a FIFO of threads waiting on an external predicate,
/// with operations to release one or all of them.
///
/// A `Condvar` is always used together with a [`Mutex`] protecting the
/// predicate. [`wait`] takes that mutex's guard, atomically releases the lock
/// and enqueues the calling thread, and hands the guard back once the thread
/// has been woken (or its deadline has passed, for [`wait_until`]): the user
/// mutex is held on entry and on exit, and callers always re-check the
/// predicate in a loop.
///
/// ```
/// use enoki_sync::{rt::StdRuntime, Condvar, Mutex};
/// use std::sync::Arc;
///
/// let pair = Arc::new((Mutex::<_, StdRuntime>::new(false), Condvar::<StdRuntime>::new()));
///
/// let worker = std::thread::spawn({
///     let pair = pair.clone();
///     move || {
///         let (mutex, condvar) = &*pair;
///         *mutex.lock() = true;
///         condvar.wake_one();
///     }
/// });
///
/// let (mutex, condvar) = &*pair;
/// let mut ready = mutex.lock();
/// while !*ready {
///     ready = condvar.wait(ready);
/// }
/// drop(ready);
/// worker.join().unwrap();
/// ```
///
/// # Wait morphing
///
/// With the `wait-morphing` feature (on by default), a signaller never wakes
/// a waiter just so it can go back to sleep contending for the user mutex.
/// Instead, [`wake_one`] and [`wake_all`] ask the user mutex to *transfer
/// ownership* to the dequeued waiter, which keeps sleeping until the lock is
/// its: when a waiter returns from [`wait`], it already holds the mutex.
/// This eliminates the classic wake/re-sleep herd on contended predicates,
/// and transferred waiters keep their FIFO position on the user mutex.
///
/// Wait morphing requires that all concurrent waiters on one `Condvar` use
/// the *same* user mutex; violating this is a usage bug and panics.
///
/// Without the feature, the wake paths set each waiter's wakeup flag
/// directly and waiters re-acquire the user mutex themselves.
///
/// # Implementation notes
///
/// Waiters link stack-allocated [`WaitRecord`]s into a singly-linked FIFO
/// (oldest/newest) guarded by an internal [`blocking::Mutex`], whose critical
/// sections are all O(1) link operations, except timeout-path removal,
/// which traverses the list. Timeouts are rare and the list is bounded by
/// the number of concurrent waiters, so the traversal is accepted; in
/// exchange, FIFO membership (checked under the internal lock) is what
/// arbitrates the race between a timeout and a concurrent signal, and the
/// loser of that race never touches a record it no longer owns.
///
/// The wake paths read a waiter count outside the internal lock to make
/// signalling with no waiters cheap. That read may miss a waiter that is
/// concurrently linking itself; this is indistinguishable from the signal
/// having been issued just before that waiter arrived, which is a legal
/// schedule.
///
/// [`Mutex`]: crate::Mutex
/// [`wait`]: Condvar::wait
/// [`wait_until`]: Condvar::wait_until
/// [`wake_one`]: Condvar::wake_one
/// [`wake_all`]: Condvar::wake_all
pub struct Condvar<R: Runtime, Lock: RawMutex = Spinlock> {
    /// The number of linked waiters.
    ///
    /// Updated inside the internal mutex, read without it on the wake fast
    /// paths.
    waiters: CachePadded<AtomicUsize>,

    /// The waiter FIFO and, in wait-morphing builds, the remembered user
    /// mutex. Mutated only with this lock held.
    queue: blocking::Mutex<Queue<R, Lock>, Lock>,
}

struct Queue<R: Runtime, Lock> {
    fifo: Fifo<R>,

    /// The user mutex shared by the current crop of waiters.
    ///
    /// Set when a waiter links itself, cleared whenever the FIFO drains. The
    /// wake paths hand this mutex to the waiters they dequeue.
    #[cfg(feature = "wait-morphing")]
    user_mutex: Option<NonNull<Raw<R, Lock>>>,

    #[cfg(not(feature = "wait-morphing"))]
    _lock: PhantomData<Lock>,
}

/// The waiter FIFO: a singly-linked list of wait records in arrival order.
///
/// The records are owned by their waiter threads' stacks; the FIFO holds
/// non-owning pointers, and a record's `next` link belongs to the FIFO only
/// while the record is linked. Once detached, a record may be touched by
/// nobody but the detaching signaller, until its wake lands.
struct Fifo<R: Runtime> {
    oldest: Option<NonNull<WaitRecord<R>>>,
    newest: Option<NonNull<WaitRecord<R>>>,
}

// === impl Condvar ===

impl<R: Runtime> Condvar<R> {
    loom_const_fn! {
        /// Returns a new `Condvar` with no waiters, using a [`Spinlock`] as
        /// its internal mutex.
        #[must_use]
        pub fn new() -> Self {
            Self::new_with_raw_mutex(Spinlock::new())
        }
    }
}

impl<R: Runtime, Lock: RawMutex> Condvar<R, Lock> {
    loom_const_fn! {
        /// Returns a new `Condvar` with no waiters, using `lock` as the
        /// [`RawMutex`] guarding its waiter FIFO.
        #[must_use]
        pub fn new_with_raw_mutex(lock: Lock) -> Self {
            Self {
                waiters: CachePadded::new(AtomicUsize::new(0)),
                queue: blocking::Mutex::new_with_raw_mutex(Queue::new(), lock),
            }
        }
    }

    /// Releases `guard`'s mutex and blocks the current thread until this
    /// condition variable receives a wakeup, then re-acquires the mutex and
    /// returns its guard.
    ///
    /// The returned guard does **not** imply the predicate is true: callers
    /// re-check it in a loop (or use [`wait_while`](Condvar::wait_while)).
    /// This condition variable produces no spurious wakeups (a return is
    /// always the result of a [`wake_one`](Condvar::wake_one) or
    /// [`wake_all`](Condvar::wake_all)), but the predicate may have changed
    /// again by the time the waiter runs.
    ///
    /// # Panics
    ///
    /// In wait-morphing builds, if another thread is concurrently waiting on
    /// this `Condvar` with a different mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T, R, Lock>) -> MutexGuard<'a, T, R, Lock> {
        let (guard, _) = self.wait_inner(guard, None);
        guard
    }

    /// Like [`wait`](Condvar::wait), but gives up at `deadline`: if no wakeup
    /// has arrived by then, the wait ends and the returned
    /// [`WaitTimeoutResult`] reports the timeout.
    ///
    /// The user mutex is re-acquired and held on return in either case.
    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T, R, Lock>,
        deadline: R::Instant,
    ) -> (MutexGuard<'a, T, R, Lock>, WaitTimeoutResult) {
        self.wait_inner(guard, Some(deadline))
    }

    /// Blocks the current thread until `condition` returns `false`.
    ///
    /// Equivalent to calling [`wait`](Condvar::wait) in a loop while
    /// `condition` holds for the guarded data.
    ///
    /// # Examples
    ///
    /// ```
    /// use enoki_sync::{rt::StdRuntime, Condvar, Mutex};
    /// use std::sync::Arc;
    ///
    /// let pair = Arc::new((Mutex::<_, StdRuntime>::new(0), Condvar::<StdRuntime>::new()));
    ///
    /// let worker = std::thread::spawn({
    ///     let pair = pair.clone();
    ///     move || {
    ///         *pair.0.lock() = 10;
    ///         pair.1.wake_all();
    ///     }
    /// });
    ///
    /// let (mutex, condvar) = &*pair;
    /// let guard = condvar.wait_while(mutex.lock(), |n| *n < 10);
    /// assert_eq!(*guard, 10);
    /// # drop(guard);
    /// # worker.join().unwrap();
    /// ```
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T, R, Lock>,
        mut condition: F,
    ) -> MutexGuard<'a, T, R, Lock>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes the oldest waiter, if there is one.
    ///
    /// In wait-morphing builds the waiter is not made runnable directly:
    /// ownership of the user mutex is transferred to it, and it wakes
    /// already holding the lock. Unlike some condition variables, no wakeup
    /// is stored when there are no waiters; a `wake_one` with an empty FIFO
    /// is a no-op.
    pub fn wake_one(&self) {
        trace!(condvar = ?fmt::ptr(self), "Condvar::wake_one");

        // Check for waiters outside the lock, so that signalling with none
        // doesn't contend on the internal mutex. A waiter that has not yet
        // linked itself is, by definition, not yet waiting.
        if self.waiters.load(SeqCst) == 0 {
            return;
        }

        #[cfg(feature = "wait-morphing")]
        self.queue.with_lock(|q| {
            // Re-check under the lock; the waiter may have timed out, or
            // another signaller may have beaten us to it.
            let Some(wr) = (unsafe { q.fifo.pop() }) else {
                return;
            };
            self.waiters.fetch_sub(1, SeqCst);
            let user_mutex = q
                .user_mutex
                .expect("a linked waiter always has a recorded user mutex");
            // Rather than waking the waiter here and having it wait again
            // for the user mutex, hand the mutex over: the waiter keeps
            // sleeping until the lock is its.
            //
            // Safety: the FIFO was non-empty, so at least one waiter is
            // still inside `wait` borrowing this mutex, which keeps it
            // alive. The record is detached and unwoken, as `send_lock`
            // requires.
            unsafe { user_mutex.as_ref().send_lock(wr) };
            if q.fifo.is_empty() {
                q.user_mutex = None;
            }
        });

        #[cfg(not(feature = "wait-morphing"))]
        {
            let wr = self.queue.with_lock(|q| {
                let wr = unsafe { q.fifo.pop() };
                if wr.is_some() {
                    self.waiters.fetch_sub(1, SeqCst);
                }
                wr
            });
            if let Some(wr) = wr {
                // Safety: the record is detached, and its thread cannot
                // return from `wait` until this wake lands.
                unsafe { wr.as_ref().wake() };
            }
        }
    }

    /// Wakes every waiter present when the internal lock is taken.
    ///
    /// Waiters that arrive afterwards are not woken. Like
    /// [`wake_one`](Condvar::wake_one), this is a no-op when nobody is
    /// waiting.
    ///
    /// In wait-morphing builds the whole FIFO is detached in one step and
    /// the user mutex is handed to each record in turn, outside the internal
    /// lock. As an optimization, handoffs to waiters whose threads sit on
    /// the same CPU are issued back to back, since same-CPU wakeups are
    /// cheaper; this only reorders the transfer *requests*, and lock
    /// ownership still serializes the waiters themselves.
    pub fn wake_all(&self) {
        trace!(condvar = ?fmt::ptr(self), "Condvar::wake_all");

        if self.waiters.load(SeqCst) == 0 {
            return;
        }

        #[cfg(feature = "wait-morphing")]
        {
            let (head, user_mutex) = self.queue.with_lock(|q| {
                let head = unsafe { q.fifo.take_all() };
                if head.is_some() {
                    self.waiters.store(0, SeqCst);
                }
                (head, q.user_mutex.take())
            });
            let Some(head) = head else { return };
            let user_mutex =
                user_mutex.expect("a linked waiter always has a recorded user mutex");

            // Every record in the detached chain is pending its wake; this
            // walk is the only code allowed to touch them. Links are read
            // before each handoff, because a record may be gone the moment
            // its wake lands.
            let mut wr = Some(head);
            while let Some(curr) = wr {
                let mut next = unsafe { curr.as_ref().next() };
                let cpu = R::current_cpu(unsafe { curr.as_ref().thread() });
                // Safety: each record in the chain belongs to a waiter still
                // blocked in `wait` borrowing the user mutex, which keeps
                // the mutex alive for the duration of the walk.
                unsafe { user_mutex.as_ref().send_lock(curr) };

                // Queue the transfers of all waiters that will likely wake
                // on the same CPU one after another, splicing them out of
                // the chain.
                let mut prev: Option<NonNull<WaitRecord<R>>> = None;
                let mut rest = next;
                while let Some(r) = rest {
                    let after = unsafe { r.as_ref().next() };
                    if R::current_cpu(unsafe { r.as_ref().thread() }) == cpu {
                        unsafe { user_mutex.as_ref().send_lock(r) };
                        match prev {
                            None => next = after,
                            Some(prev) => unsafe { prev.as_ref().set_next(after) },
                        }
                    } else {
                        prev = Some(r);
                    }
                    rest = after;
                }

                wr = next;
            }
        }

        #[cfg(not(feature = "wait-morphing"))]
        {
            let head = self.queue.with_lock(|q| {
                let head = unsafe { q.fifo.take_all() };
                if head.is_some() {
                    self.waiters.store(0, SeqCst);
                }
                head
            });
            let mut wr = head;
            while let Some(curr) = wr {
                wr = unsafe { curr.as_ref().next() };
                // Safety: the record is detached, and its thread cannot
                // return from `wait` until this wake lands.
                unsafe { curr.as_ref().wake() };
            }
        }
    }

    /// Returns the number of threads currently waiting on this `Condvar`.
    ///
    /// This is inherently racy and useful only for diagnostics and tests.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.load(SeqCst)
    }

    fn wait_inner<'a, T>(
        &self,
        guard: MutexGuard<'a, T, R, Lock>,
        deadline: Option<R::Instant>,
    ) -> (MutexGuard<'a, T, R, Lock>, WaitTimeoutResult) {
        trace!(condvar = ?fmt::ptr(self), ?deadline, "Condvar::wait");
        let mutex = guard.mutex();
        let record = pin!(WaitRecord::<R>::new(R::current()));
        let ptr = NonNull::from(&*record);

        self.queue.with_lock(|q| {
            #[cfg(feature = "wait-morphing")]
            {
                // The wake paths will hand the remembered mutex to every
                // waiter they dequeue, so all concurrent waiters must agree
                // on it. Checked before linking and before the guard is
                // released, so a violation unwinds with everything intact.
                let raw = NonNull::from(mutex.raw());
                match q.user_mutex {
                    None => q.user_mutex = Some(raw),
                    Some(prev) => assert!(
                        prev == raw,
                        "all concurrent `wait`s on a condvar must use the same mutex"
                    ),
                }
            }

            unsafe { q.fifo.push(ptr) };
            self.waiters.fetch_add(1, SeqCst);

            // The user mutex and the internal mutex are released back to
            // back; keeping preemption off in between avoids a pointless
            // context switch.
            R::preempt_disable();
            drop(guard);
        });
        R::preempt_enable();

        record.wait(deadline);

        let mut timed_out = false;
        if !record.woken() {
            // The deadline fired. Only FIFO membership, checked under the
            // internal lock, decides who won: a signaller may have detached
            // this record already.
            let removed = self.queue.with_lock(|q| {
                let removed = unsafe { q.fifo.remove(ptr) };
                if removed {
                    self.waiters.fetch_sub(1, SeqCst);
                    #[cfg(feature = "wait-morphing")]
                    if q.fifo.is_empty() {
                        q.user_mutex = None;
                    }
                }
                removed
            });
            if removed {
                test_debug!(record = ?fmt::ptr(&*record), "Condvar::wait -> timed out");
                timed_out = true;
            } else {
                // A signaller claimed the record first; its wake (or the
                // mutex handoff) is in flight. The record cannot be
                // invalidated until that lands, so wait for it and treat the
                // wait as signalled.
                test_debug!(record = ?fmt::ptr(&*record), "Condvar::wait -> lost timeout race");
                record.wait(None);
            }
        }

        #[cfg(feature = "wait-morphing")]
        let guard = if record.woken() {
            // The handoff protocol only wakes a record once its thread owns
            // the user mutex, so there is nothing to acquire.
            unsafe { mutex.receive_lock() }
        } else {
            mutex.lock()
        };
        #[cfg(not(feature = "wait-morphing"))]
        let guard = mutex.lock();

        (guard, WaitTimeoutResult::new(timed_out))
    }
}

impl<R: Runtime, Lock: RawMutex> fmt::Debug for Condvar<R, Lock> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish_non_exhaustive()
    }
}

// === impl Queue ===

impl<R: Runtime, Lock> Queue<R, Lock> {
    const fn new() -> Self {
        Self {
            fifo: Fifo::new(),
            #[cfg(feature = "wait-morphing")]
            user_mutex: None,
            #[cfg(not(feature = "wait-morphing"))]
            _lock: PhantomData,
        }
    }
}

/// Safety: the pointers in a `Queue` are non-owning references to wait
/// records (and, in wait-morphing builds, to a user mutex) whose owners
/// outlive their membership; they are only dereferenced under the condvar's
/// internal mutex, or by the signaller that detached them.
unsafe impl<R: Runtime, Lock> Send for Queue<R, Lock> {}

// === impl Fifo ===

impl<R: Runtime> Fifo<R> {
    const fn new() -> Self {
        Self {
            oldest: None,
            newest: None,
        }
    }

    fn is_empty(&self) -> bool {
        debug_assert_eq!(self.oldest.is_none(), self.newest.is_none());
        self.oldest.is_none()
    }

    /// Appends `record` as the newest waiter.
    ///
    /// # Safety
    ///
    /// The caller must hold the condvar's internal mutex, and `record` must
    /// outlive its membership in the FIFO.
    unsafe fn push(&mut self, record: NonNull<WaitRecord<R>>) {
        unsafe {
            record.as_ref().set_next(None);
            match self.newest {
                Some(newest) => newest.as_ref().set_next(Some(record)),
                None => self.oldest = Some(record),
            }
        }
        self.newest = Some(record);
    }

    /// Detaches and returns the oldest waiter.
    ///
    /// # Safety
    ///
    /// The caller must hold the condvar's internal mutex.
    unsafe fn pop(&mut self) -> Option<NonNull<WaitRecord<R>>> {
        let oldest = self.oldest?;
        let next = unsafe { oldest.as_ref().next() };
        self.oldest = next;
        if next.is_none() {
            self.newest = None;
        }
        Some(oldest)
    }

    /// Detaches the entire list, returning the head of the chain. The chain
    /// stays threaded through the records' `next` links, which now belong to
    /// the caller.
    ///
    /// # Safety
    ///
    /// The caller must hold the condvar's internal mutex.
    unsafe fn take_all(&mut self) -> Option<NonNull<WaitRecord<R>>> {
        self.newest = None;
        self.oldest.take()
    }

    /// Unlinks `record` if it is a member of this FIFO, returning whether it
    /// was. O(n) in the number of waiters; only the timeout path uses this.
    ///
    /// # Safety
    ///
    /// The caller must hold the condvar's internal mutex.
    unsafe fn remove(&mut self, record: NonNull<WaitRecord<R>>) -> bool {
        let Some(oldest) = self.oldest else {
            return false;
        };
        if oldest == record {
            unsafe { self.pop() };
            return true;
        }
        let mut prev = oldest;
        loop {
            let Some(curr) = (unsafe { prev.as_ref().next() }) else {
                return false;
            };
            if curr == record {
                let next = unsafe { curr.as_ref().next() };
                unsafe { prev.as_ref().set_next(next) };
                if next.is_none() {
                    self.newest = Some(prev);
                }
                return true;
            }
            prev = curr;
        }
    }
}
