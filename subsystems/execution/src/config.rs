//! # Scheduler Configuration

use core::time::Duration;

use unisched_hal::context::MIN_STACK_SIZE;
use unisched_hal::{cpu, MAX_CPUS};

use crate::error::{SchedError, SchedResult};

/// Default scheduler tick
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Default runtime lead a thread may take over the next ready thread
/// before the tick preempts it
pub const DEFAULT_HYSTERESIS: Duration = Duration::from_millis(5);

/// Default thread stack size
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of CPUs to bring up
    pub cpus: usize,
    /// Periodic tick interval
    pub tick: Duration,
    /// Weighted runtime lead tolerated before preemption
    pub hysteresis: Duration,
    /// Stack size for threads that do not request one
    pub stack_size: usize,
    /// Let idle CPUs steal queued threads
    pub load_balance: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpus: cpu::available_cpus(),
            tick: DEFAULT_TICK,
            hysteresis: DEFAULT_HYSTERESIS,
            stack_size: DEFAULT_STACK_SIZE,
            load_balance: true,
        }
    }
}

impl SchedConfig {
    /// Set the CPU count
    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set the tick interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set the preemption hysteresis
    pub fn with_hysteresis(mut self, hysteresis: Duration) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    /// Set the default stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Enable or disable load balancing
    pub fn with_load_balance(mut self, enabled: bool) -> Self {
        self.load_balance = enabled;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> SchedResult<()> {
        if self.cpus == 0 {
            return Err(SchedError::InvalidConfig("at least one cpu is required"));
        }
        if self.cpus > MAX_CPUS {
            return Err(SchedError::InvalidConfig("too many cpus"));
        }
        if self.tick.is_zero() {
            return Err(SchedError::InvalidConfig("tick must be non-zero"));
        }
        if self.hysteresis.as_nanos() > u128::from(u64::MAX) {
            return Err(SchedError::InvalidConfig("hysteresis too large"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SchedError::InvalidConfig("stack size too small"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SchedConfig::default();
        assert!(config.cpus >= 1 && config.cpus <= MAX_CPUS);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects() {
        let base = SchedConfig::default();
        assert!(base.clone().with_cpus(0).validate().is_err());
        assert!(base.clone().with_cpus(MAX_CPUS + 1).validate().is_err());
        assert!(base.clone().with_tick(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_hysteresis(Duration::MAX).validate().is_err());
        assert!(base.with_stack_size(1024).validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = SchedConfig::default()
            .with_cpus(2)
            .with_tick(Duration::from_millis(1))
            .with_hysteresis(Duration::ZERO)
            .with_load_balance(false);
        assert_eq!(config.cpus, 2);
        assert_eq!(config.tick, Duration::from_millis(1));
        assert_eq!(config.hysteresis, Duration::ZERO);
        assert!(!config.load_balance);
    }
}
