//! The spinlock used as the default raw mutex for short critical sections.
//!
//! All of the queues in this crate are guarded by a [`blocking::Mutex`] whose
//! critical sections are O(1) link operations (with the one documented
//! exception of timeout-path removal), so a spinlock is the appropriate
//! default implementation. A runtime with something better (say, a lock that
//! also masks interrupts) can substitute it through the [`RawMutex`] trait.
//!
//! [`blocking::Mutex`]: crate::blocking::Mutex

use crate::{
    blocking::RawMutex,
    loom::sync::atomic::{AtomicBool, Ordering::*},
    util::Backoff,
};

/// A spinlock-based [`RawMutex`] implementation.
///
/// While contended, this lock spins with an exponential backoff.
#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
}

// === impl Spinlock ===

impl Spinlock {
    loom_const_fn! {
        /// Returns a new `Spinlock`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { locked: AtomicBool::new(false) }
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for Spinlock {
    #[cfg_attr(test, track_caller)]
    fn lock(&self) {
        let mut boff = Backoff::default();
        while test_dbg!(self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_err())
        {
            while test_dbg!(self.is_locked()) {
                boff.spin();
            }
        }
    }

    #[cfg_attr(test, track_caller)]
    #[inline]
    fn try_lock(&self) -> bool {
        test_dbg!(self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok())
    }

    #[cfg_attr(test, track_caller)]
    #[inline]
    unsafe fn unlock(&self) {
        test_dbg!(self.locked.store(false, Release));
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}
