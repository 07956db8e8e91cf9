//! # Thread States
//!
//! ```text
//!              start()            wake()             dispatch
//! Unstarted ──────────> Waiting ──────────> Ready ──────────> Running
//!                          ^                  ^                  │
//!                          │                  └──── yield ───────┤
//!                          └─────────── prepare_wait ────────────┤
//!                                                                 └──> Terminated
//! ```
//!
//! There is no `Waiting -> Running` edge: a woken thread always passes
//! through `Ready` and is dispatched by the scheduler, even when it never
//! left its CPU.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Created, `start()` not called yet
    Unstarted = 0,
    /// Blocked until woken
    Waiting   = 1,
    /// Runnable, waiting for its CPU
    Ready     = 2,
    /// Owns its CPU
    Running   = 3,
    /// Finished; never runs again
    Terminated = 4,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Waiting,
            2 => Self::Ready,
            3 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`Status`]
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) const fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> Status {
        Status::from(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`; returns whether the transition happened
    #[inline]
    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
