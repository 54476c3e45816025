use core::ops::{Deref, DerefMut};

/// Pads and aligns a value to the size of a cache line, so that false sharing
/// with neighboring values is avoided.
///
/// Alignments are chosen per architecture: 128 bytes on x86-64 and AArch64
/// (which prefetch cache lines in pairs), 64 elsewhere.
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "powerpc64")),
    repr(align(64))
)]
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq, Debug)]
pub struct CachePadded<T>(T);

// === impl CachePadded ===

impl<T> CachePadded<T> {
    /// Pads `value` to the size of a cache line.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Unpads the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
