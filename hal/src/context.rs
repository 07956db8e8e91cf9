//! # Execution Contexts
//!
//! A [`Context`] is the architecture half of a thread. On bare metal it would
//! hold the saved stack, instruction and frame pointers; in the hosted backend
//! it is a host thread plus a run permit.
//!
//! ## Run permit
//!
//! The permit is a single sticky token. [`Context::resume`] deposits it and
//! [`Context::suspend`] consumes it, blocking until one is available. A resume
//! that arrives before the matching suspend is not lost, which lets the
//! scheduler publish a state change, release its locks, and only then hand
//! over the CPU.

use std::panic::{self, AssertUnwindSafe};

use parking_lot::{Condvar, Mutex};

use crate::{HalError, HalResult};

/// Minimum stack size accepted for a new context
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Execution context
#[derive(Debug, Default)]
pub struct Context {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl Context {
    /// Create a context that holds no run permit
    pub const fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Hand the run permit to this context
    pub fn resume(&self) {
        *self.permit.lock() = true;
        self.cond.notify_one();
    }

    /// Block the calling host thread until this context holds the run permit
    ///
    /// Must only be called from the host thread backing this context.
    pub fn suspend(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.cond.wait(&mut permit);
        }
        *permit = false;
    }
}

/// Switch from `from` (the caller) to `to`
///
/// Returns when some other context resumes `from`.
pub fn switch_to(from: &Context, to: &Context) {
    #[cfg(feature = "debug")]
    log::trace!("switch {:p} -> {:p}", from, to);

    to.resume();
    from.suspend();
}

/// Create the host side of an execution context
///
/// `entry` runs on a new host thread with a stack of `stack_size` bytes. The
/// entry is expected to suspend itself until it is first dispatched. A panic
/// escaping `entry` is fatal for the whole system.
pub fn spawn<F>(name: &str, stack_size: usize, entry: F) -> HalResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let context_name = name.to_owned();

    std::thread::Builder::new()
        .name(context_name.clone())
        .stack_size(stack_size.max(MIN_STACK_SIZE))
        .spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                eprintln!("fatal: context '{}' panicked, halting", context_name);
                std::process::abort();
            }
        })
        .map(drop)
        .map_err(|err| HalError::ContextSpawn {
            name: name.to_owned(),
            kind: err.kind(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_permit_is_sticky() {
        let ctx = Context::new();
        ctx.resume();
        // Must not block: the permit was deposited first.
        ctx.suspend();
    }

    #[test]
    fn test_ping_pong() {
        let main = Arc::new(Context::new());
        let worker = Arc::new(Context::new());
        let turns = Arc::new(AtomicUsize::new(0));

        let (m, w, t) = (main.clone(), worker.clone(), turns.clone());
        spawn("ping", 64 * 1024, move || {
            for _ in 0..3 {
                w.suspend();
                t.fetch_add(1, Ordering::SeqCst);
                m.resume();
            }
        })
        .unwrap();

        for i in 0..3 {
            switch_to(&main, &worker);
            assert_eq!(turns.load(Ordering::SeqCst), i + 1);
        }
    }
}
