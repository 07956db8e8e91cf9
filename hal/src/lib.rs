//! # unisched Hardware Abstraction Layer
//!
//! The narrow architecture interface consumed by the scheduler core:
//!
//! - [`cpu`]: boot CPU identification and CPU limits
//! - [`context`]: execution contexts and `switch_to`
//! - [`clock`]: monotonic uptime
//! - [`clockevent`]: one-shot and periodic clock-event device
//! - [`tls`]: the per-context "current" slot
//! - [`console`]: console output and the `log` backend
//!
//! ## Hosted backend
//!
//! This backend runs on a development host. Each execution context is a host
//! thread gated by a run permit: a context only executes after another one
//! handed it the permit through [`context::switch_to`] or
//! [`Context::resume`](context::Context::resume). The clock-event device is a
//! host thread that calls back into the scheduler the way a timer interrupt
//! would.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod clock;
pub mod clockevent;
pub mod console;
pub mod context;
pub mod cpu;
pub mod tls;

use core::fmt;

pub use cpu::MAX_CPUS;

/// HAL result type
pub type HalResult<T> = Result<T, HalError>;

/// HAL error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// The host refused to create an execution context
    ContextSpawn {
        /// Name of the context
        name: String,
        /// Host error kind
        kind: std::io::ErrorKind,
    },
    /// The clock-event device could not be started
    ClockEventUnavailable,
    /// A logger was already installed
    LoggerAlreadySet,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextSpawn { name, kind } => {
                write!(f, "cannot create execution context '{}': {}", name, kind)
            },
            Self::ClockEventUnavailable => write!(f, "clock-event device unavailable"),
            Self::LoggerAlreadySet => write!(f, "a logger is already installed"),
        }
    }
}

impl std::error::Error for HalError {}
