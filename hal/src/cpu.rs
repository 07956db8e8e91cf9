//! # CPU Identification

use std::num::NonZeroUsize;

/// Maximum number of CPUs supported
///
/// Per-CPU bitmaps are one machine word wide.
pub const MAX_CPUS: usize = 64;

static_assertions::const_assert!(MAX_CPUS <= u64::BITS as usize);

/// Boot CPU ID
pub const BOOT_CPU_ID: usize = 0;

/// Get the ID of the CPU that brought the system up
///
/// Usable before any scheduler structure exists.
#[inline]
pub fn boot_cpu_id() -> usize {
    BOOT_CPU_ID
}

/// Number of CPUs the host can actually run in parallel, capped at [`MAX_CPUS`]
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        .min(MAX_CPUS)
}

/// Spin-loop hint
#[inline]
pub fn relax() {
    std::thread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_cpus_bounds() {
        let n = available_cpus();
        assert!(n >= 1);
        assert!(n <= MAX_CPUS);
    }

    #[test]
    fn test_boot_cpu() {
        assert_eq!(boot_cpu_id(), BOOT_CPU_ID);
        assert!(boot_cpu_id() < MAX_CPUS);
    }
}
