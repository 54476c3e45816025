//! The contract `enoki-sync` consumes from its threading runtime.
//!
//! The synchronization primitives in this crate block *threads*, not tasks,
//! so they need a small set of services from the runtime that owns those
//! threads: a handle to the current thread, park/unpark, a way to arm an
//! absolute-time wakeup while parking, a CPU affinity hint, and nestable
//! preemption control. The [`Runtime`] trait names exactly those services and
//! nothing else; the scheduler and timer implementations behind them are the
//! runtime's business.
//!
//! Hosted targets (and this crate's tests) can use [`StdRuntime`], which
//! binds the contract to [`std::thread`].

use core::fmt;

/// A threading runtime that this crate's primitives can block on.
///
/// # Parking protocol
///
/// [`park`] and [`unpark`] must follow the permit protocol of
/// [`std::thread::park`]: an `unpark` makes a subsequent (or concurrent)
/// `park` by the target thread return immediately, and `park` is allowed to
/// return spuriously. The primitives in this crate re-check their wakeup
/// conditions in a loop around `park`, so spurious parker returns never
/// surface as spurious wakeups.
///
/// [`unpark`] must remain safe to call on a [`Thread`] handle after the
/// thread it names has returned from its wait (the handle is cloned before a
/// wakeup is published, and the wakeup may race the waker's final `unpark`).
///
/// # Preemption
///
/// [`preempt_disable`] and [`preempt_enable`] bracket short windows in which
/// a context switch would be wasteful (such as the back-to-back release of
/// two locks on the wait path). They must nest. They are purely an
/// optimization: a runtime that cannot control preemption may make them
/// no-ops without affecting correctness.
///
/// [`park`]: Runtime::park
/// [`unpark`]: Runtime::unpark
/// [`Thread`]: Runtime::Thread
/// [`preempt_disable`]: Runtime::preempt_disable
/// [`preempt_enable`]: Runtime::preempt_enable
pub trait Runtime {
    /// A cheaply cloneable handle to a thread.
    type Thread: Clone + Send + Sync + fmt::Debug;

    /// An absolute timestamp, used for wait deadlines.
    type Instant: Copy + PartialOrd + Send + fmt::Debug;

    /// Returns a handle to the calling thread.
    fn current() -> Self::Thread;

    /// Returns the current time.
    fn now() -> Self::Instant;

    /// Blocks the calling thread until a permit is made available by
    /// [`unpark`](Runtime::unpark). May return spuriously.
    fn park();

    /// Like [`park`](Runtime::park), but also arms a wakeup for the calling
    /// thread at `deadline`. Returns when unparked, when the deadline has
    /// passed, or spuriously; the caller is responsible for telling these
    /// apart.
    fn park_until(deadline: Self::Instant);

    /// Makes a permit available to `thread`, waking it if it is parked.
    fn unpark(thread: &Self::Thread);

    /// Returns the CPU that `thread` is presently assigned to.
    ///
    /// This is only ever used as an affinity hint (to batch wakeups that will
    /// resume on the same CPU); it is always correct to return a constant.
    fn current_cpu(thread: &Self::Thread) -> usize;

    /// Disables preemption of the calling thread. Nestable.
    fn preempt_disable();

    /// Re-enables preemption of the calling thread, balancing one
    /// [`preempt_disable`](Runtime::preempt_disable).
    fn preempt_enable();
}

feature! {
    #![any(feature = "std", test)]

    /// A [`Runtime`] backed by [`std::thread`] and [`std::time`], for hosted
    /// targets.
    ///
    /// Threads managed by `std` report no CPU assignment, so
    /// [`current_cpu`](Runtime::current_cpu) is always 0, and preemption
    /// control is a no-op.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct StdRuntime;

    impl Runtime for StdRuntime {
        type Thread = std::thread::Thread;
        type Instant = std::time::Instant;

        #[inline]
        fn current() -> Self::Thread {
            std::thread::current()
        }

        #[inline]
        fn now() -> Self::Instant {
            std::time::Instant::now()
        }

        #[inline]
        fn park() {
            std::thread::park();
        }

        fn park_until(deadline: Self::Instant) {
            if let Some(timeout) = deadline.checked_duration_since(std::time::Instant::now()) {
                std::thread::park_timeout(timeout);
            }
        }

        #[inline]
        fn unpark(thread: &Self::Thread) {
            thread.unpark();
        }

        #[inline]
        fn current_cpu(_: &Self::Thread) -> usize {
            0
        }

        #[inline]
        fn preempt_disable() {}

        #[inline]
        fn preempt_enable() {}
    }
}
