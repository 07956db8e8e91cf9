//! # Scheduler Errors

use core::fmt;

use unisched_hal::HalError;
use unisched_memory::PerCpuError;

/// Scheduler result type
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduler error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// `init()` already ran
    AlreadyInitialized,
    /// The scheduler is not initialized
    NotInitialized,
    /// Configuration rejected
    InvalidConfig(&'static str),
    /// No such CPU
    InvalidCpu(usize),
    /// Priority is not finite and positive
    InvalidPriority,
    /// The thread was already started
    AlreadyStarted,
    /// The operation needs a scheduler thread
    Unbound,
    /// Architecture layer failure
    Hal(HalError),
    /// Per-CPU storage failure
    PerCpu(PerCpuError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "scheduler already initialized"),
            Self::NotInitialized => write!(f, "scheduler not initialized"),
            Self::InvalidConfig(why) => write!(f, "invalid scheduler configuration: {}", why),
            Self::InvalidCpu(id) => write!(f, "no such cpu: {}", id),
            Self::InvalidPriority => write!(f, "priority must be finite and positive"),
            Self::AlreadyStarted => write!(f, "thread already started"),
            Self::Unbound => write!(f, "not a scheduler thread"),
            Self::Hal(err) => write!(f, "hal: {}", err),
            Self::PerCpu(err) => write!(f, "percpu: {}", err),
        }
    }
}

impl From<HalError> for SchedError {
    fn from(err: HalError) -> Self {
        Self::Hal(err)
    }
}

impl From<PerCpuError> for SchedError {
    fn from(err: PerCpuError) -> Self {
        Self::PerCpu(err)
    }
}
