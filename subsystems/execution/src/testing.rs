//! Shared scheduler instance for unit tests

use spin::Once;

use crate::{SchedConfig, SchedError};

/// CPUs the test scheduler is booted with
pub(crate) const CPUS: usize = 4;

static BOOT: Once<()> = Once::new();

/// Boot the test scheduler once per test binary
pub(crate) fn boot() {
    BOOT.call_once(|| match crate::init(SchedConfig::default().with_cpus(CPUS)) {
        Ok(()) | Err(SchedError::AlreadyInitialized) => {},
        Err(err) => panic!("test scheduler failed to boot: {}", err),
    });
}
