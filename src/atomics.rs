//! Atomic `f64` stored as raw bits in an `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` that can be read and written from multiple threads.
///
/// Plain load/store only; the audio paths never need read-modify-write on
/// floats. A torn value is impossible (the bits move as one `u64`), and a
/// stale value is fine everywhere this is used (rates, speeds, volumes).
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order);
    }
}

impl std::fmt::Debug for AtomicF64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.load(Ordering::Relaxed))
    }
}
