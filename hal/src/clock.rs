//! # Monotonic Clock

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Pin the clock epoch to now
///
/// Calling it is optional; the first clock read does the same.
pub fn init() {
    EPOCH.get_or_init(Instant::now);
}

/// Time since boot
#[inline]
pub fn uptime() -> Duration {
    EPOCH.get_or_init(Instant::now).elapsed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_is_monotonic() {
        let a = uptime();
        std::thread::sleep(Duration::from_millis(2));
        let b = uptime();
        assert!(b > a);
    }
}
