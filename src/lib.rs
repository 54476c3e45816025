#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
pub mod util;

pub(crate) mod loom;

pub mod blocking;
pub mod condvar;
pub mod mutex;
pub mod rt;
pub mod spin;
pub mod wait_record;

#[doc(inline)]
pub use self::condvar::Condvar;
#[doc(inline)]
pub use self::mutex::{Mutex, MutexGuard};
#[doc(inline)]
pub use self::rt::Runtime;
#[doc(inline)]
pub use self::wait_record::WaitRecord;

/// Whether a [`Condvar::wait_until`] call returned because of a signal or
/// because its deadline passed.
///
/// Returned alongside the re-acquired [`MutexGuard`]. Note that
/// `timed_out() == false` does not mean the predicate is true: callers always
/// re-check the predicate in a loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub(crate) const fn new(timed_out: bool) -> Self {
        Self(timed_out)
    }

    /// Returns `true` if the wait ended because the deadline passed, rather
    /// than because of a [`wake_one`] or [`wake_all`].
    ///
    /// [`wake_one`]: Condvar::wake_one
    /// [`wake_all`]: Condvar::wake_all
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        self.0
    }
}
