//! # Statistics Counters

use core::sync::atomic::{AtomicU64, Ordering};

/// Single-writer statistics counter
///
/// Only one context updates a given counter at a time (the owning thread, or
/// whoever holds the owning CPU's run-queue lock), so an increment is a plain
/// load followed by a plain store. Readers may see a slightly stale value.
#[derive(Debug, Default)]
pub struct StatCounter(AtomicU64);

impl StatCounter {
    /// New counter at zero
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn incr(&self) {
        self.0
            .store(self.0.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(&self, n: u64) {
        self.0
            .store(self.0.load(Ordering::Relaxed).wrapping_add(n), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr() {
        let c = StatCounter::new();
        c.incr();
        c.incr();
        assert_eq!(c.get(), 2);
        c.add(40);
        assert_eq!(c.get(), 42);
    }
}
