//! Miscellaneous utility structs and functions.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};

/// An `f32` that can be shared between worker threads.
#[derive(Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    /// Creates a new atomic float.
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    /// Loads the current value.
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Stores a new value.
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Debug for AtomicF32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

/// Converts a sentinel-encoded index into an `Option`.
pub(crate) fn index(raw: i32) -> Option<usize> {
    (raw >= 0).then_some(raw as usize)
}

/// Iterates over the numbers `0..count`, starting at `start % count` and wrapping around.
pub(crate) fn rotated_range(count: usize, start: usize) -> impl Iterator<Item = usize> {
    let start = if count == 0 { 0 } else { start % count };
    (start..count).chain(0..start)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn rotated_range_wraps() {
        let values = rotated_range(5, 3).collect::<Vec<_>>();
        assert_eq!(values, vec![3, 4, 0, 1, 2]);
    }

    #[test]
    fn rotated_range_start_beyond_count() {
        let values = rotated_range(4, 9).collect::<Vec<_>>();
        assert_eq!(values, vec![1, 2, 3, 0]);
        assert_eq!(rotated_range(0, 7).count(), 0);
    }

    #[test]
    fn atomic_f32_keeps_bits() {
        let value = AtomicF32::new(1.5);
        assert_approx_eq!(value.load(), 1.5);
        value.store(-0.25);
        assert_approx_eq!(value.load(), -0.25);
    }

    #[test]
    fn sentinel_index() {
        assert_eq!(index(-1), None);
        assert_eq!(index(-2), None);
        assert_eq!(index(7), Some(7));
    }
}
