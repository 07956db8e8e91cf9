//! # Counting Semaphore
//!
//! Units and a FIFO queue of waiters behind one [`SpinLock`].
//!
//! [`post`](Semaphore::post) grants units to waiters strictly in arrival
//! order and stops at the first request that does not fit, even if a later,
//! smaller one would. A waiter that times out removes its own record and
//! lets the next in line try again.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use super::spinlock::{SpinLock, SpinLockGuard};
use crate::thread::Thread;
use crate::timer::Timer;
use crate::wait::wait_until;

/// A blocked `wait()` call
struct WaitRecord {
    thread: Arc<Thread>,
    units: u32,
    /// Set by `post()` once the units have been handed over
    granted: AtomicBool,
}

impl WaitRecord {
    fn granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

struct SemState {
    value: u32,
    waiters: VecDeque<Arc<WaitRecord>>,
}

impl SemState {
    /// Grant units to waiters from the front while they fit
    fn grant(&mut self) {
        while let Some(head) = self.waiters.front() {
            if head.units > self.value {
                break;
            }
            self.value -= head.units;
            head.granted.store(true, Ordering::SeqCst);
            head.thread.wake();
            self.waiters.pop_front();
        }
    }
}

/// Counting semaphore
pub struct Semaphore {
    state: SpinLock<SemState>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("value", &state.value)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore holding `value` units
    pub const fn new(value: u32) -> Self {
        Self {
            state: SpinLock::new(SemState {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Add `units` and wake the waiters they satisfy, in FIFO order
    ///
    /// # Panics
    ///
    /// Panics if the value would overflow.
    #[track_caller]
    pub fn post(&self, units: u32) {
        let mut state = self.state.lock();
        let Some(value) = state.value.checked_add(units) else {
            let held = state.value;
            drop(state);
            panic!("semaphore: value overflow posting {} units to {}", units, held);
        };
        state.value = value;
        state.grant();
    }

    /// Take `units`, blocking until they are granted or `timer` expires
    ///
    /// Returns `true` when the units were taken.
    ///
    /// # Panics
    ///
    /// Panics if `timer` belongs to another thread; its expiry would never
    /// wake the caller.
    #[track_caller]
    pub fn wait(&self, units: u32, timer: Option<&Timer>) -> bool {
        if let Some(timer) = timer {
            if !Arc::ptr_eq(timer.owner(), &Thread::current()) {
                panic!("semaphore: wait timer owned by another thread");
            }
        }
        let mut state = self.state.lock();
        if state.value >= units {
            state.value -= units;
            return true;
        }

        let record = Arc::new(WaitRecord {
            thread: Thread::current(),
            units,
            granted: AtomicBool::new(false),
        });
        state.waiters.push_back(record.clone());

        let mut state = wait_until(state, |_| {
            record.granted() || timer.is_some_and(Timer::expired)
        });

        if record.granted() {
            return true;
        }

        // Timed out: withdraw, then let the new head try.
        Self::withdraw(&mut state, &record);
        state.grant();
        false
    }

    /// Take `units`, giving up after `timeout`
    pub fn wait_timeout(&self, units: u32, timeout: Duration) -> bool {
        let timer = Timer::for_current();
        timer.set_after(timeout);
        self.wait(units, Some(&timer))
    }

    /// Take `units` without blocking
    ///
    /// Succeeds iff at least `units` are available.
    pub fn trywait(&self, units: u32) -> bool {
        let mut state = self.state.lock();
        if state.value >= units {
            state.value -= units;
            true
        } else {
            false
        }
    }

    /// Units currently available
    pub fn value(&self) -> u32 {
        self.state.lock().value
    }

    /// Number of blocked waiters
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn withdraw(state: &mut SpinLockGuard<'_, SemState>, record: &Arc<WaitRecord>) {
        if let Some(pos) = state.waiters.iter().position(|r| Arc::ptr_eq(r, record)) {
            state.waiters.remove(pos);
        }
    }
}
