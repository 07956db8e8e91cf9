//! # Thread Timers
//!
//! One-shot timers owned by a thread. Armed timers sit in a global list
//! ordered by (deadline, id); the clock-event device is always programmed
//! for the head of that list. When it fires, every due timer is marked
//! expired and its owner woken. Owners observe expiry through
//! [`Timer::expired`], typically inside a wait predicate.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use core::time::Duration;

use spin::Mutex;
use unisched_hal::clock;
use unisched_hal::clockevent::{clock_event, ClockEventCallback};

use crate::sched;
use crate::thread::Thread;

/// Timer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimerState {
    Free    = 0,
    Armed   = 1,
    Expired = 2,
}

impl From<u8> for TimerState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Armed,
            2 => Self::Expired,
            _ => Self::Free,
        }
    }
}

struct TimerInner {
    id: u64,
    owner: Arc<Thread>,
    state: AtomicU8,
    /// Valid while armed; only changed under the timer list lock
    deadline: AtomicU64,
}

impl TimerInner {
    fn state(&self) -> TimerState {
        TimerState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TimerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn key(&self) -> (Duration, u64) {
        (Duration::from_nanos(self.deadline.load(Ordering::SeqCst)), self.id)
    }
}

type TimerKey = (Duration, u64);

static TIMERS: Mutex<BTreeMap<TimerKey, Arc<TimerInner>>> = Mutex::new(BTreeMap::new());

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

fn to_nanos(deadline: Duration) -> u64 {
    u64::try_from(deadline.as_nanos()).unwrap_or(u64::MAX)
}

/// A one-shot timer
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner.id())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Timer {
    /// Timer that wakes `owner` on expiry
    pub fn new(owner: Arc<Thread>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                owner,
                state: AtomicU8::new(TimerState::Free as u8),
                deadline: AtomicU64::new(0),
            }),
        }
    }

    /// Timer owned by the calling thread
    pub fn for_current() -> Self {
        Self::new(Thread::current())
    }

    /// Arm for an absolute uptime `deadline`, replacing any earlier setting
    pub fn set(&self, deadline: Duration) {
        let mut timers = TIMERS.lock();
        if self.inner.state() == TimerState::Armed {
            timers.remove(&self.inner.key());
        }
        self.inner.deadline.store(to_nanos(deadline), Ordering::SeqCst);
        self.inner.set_state(TimerState::Armed);
        let key = self.inner.key();
        timers.insert(key, self.inner.clone());

        let is_head = timers.first_key_value().is_some_and(|(head, _)| *head == key);
        if is_head {
            log::trace!("timer {}: programming clock event for {:?}", self.inner.id, key.0);
            clock_event().set(key.0);
        }
    }

    /// Arm to fire `duration` from now
    pub fn set_after(&self, duration: Duration) {
        self.set(clock::uptime() + duration);
    }

    /// Whether the timer has fired since it was last armed
    pub fn expired(&self) -> bool {
        self.inner.state() == TimerState::Expired
    }

    /// Whether the timer is waiting to fire
    pub fn armed(&self) -> bool {
        self.inner.state() == TimerState::Armed
    }

    /// Disarm; also clears a past expiry
    pub fn cancel(&self) {
        let mut timers = TIMERS.lock();
        if self.inner.state() == TimerState::Armed {
            timers.remove(&self.inner.key());
        }
        self.inner.set_state(TimerState::Free);
    }

    /// Thread woken on expiry
    pub fn owner(&self) -> &Arc<Thread> {
        &self.inner.owner
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Expire every due timer and reprogram the device for the next one
pub(crate) fn fired() {
    let now = clock::uptime();
    let mut due: Vec<Arc<TimerInner>> = Vec::new();
    {
        let mut timers = TIMERS.lock();
        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            timer.set_state(TimerState::Expired);
            due.push(timer);
        }
        if let Some((next, _)) = timers.first_key_value() {
            clock_event().set(next.0);
        }
    }

    for timer in due {
        timer.owner.wake();
    }
}

/// Receiver of the clock-event device
#[derive(Debug)]
pub(crate) struct ClockDispatch;

impl ClockEventCallback for ClockDispatch {
    fn fired(&self) {
        fired();
    }

    fn tick(&self) {
        sched::tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::wait::wait_until_unlocked;

    #[test]
    fn test_states() {
        let timer = Timer::for_current();
        assert!(!timer.armed());
        assert!(!timer.expired());
        timer.set_after(Duration::from_secs(3600));
        assert!(timer.armed());
        timer.cancel();
        assert!(!timer.armed());
        assert!(!timer.expired());
    }

    #[test]
    fn test_expiry_wakes_owner() {
        testing::boot();
        let timer = Timer::for_current();
        let start = clock::uptime();
        timer.set_after(Duration::from_millis(15));
        wait_until_unlocked(|| timer.expired());
        assert!(clock::uptime() - start >= Duration::from_millis(15));
        assert!(!timer.armed());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        testing::boot();
        let timer = Timer::for_current();
        timer.set_after(Duration::from_secs(3600));
        timer.set_after(Duration::from_millis(5));
        wait_until_unlocked(|| timer.expired());
        assert!(timer.expired());
    }

    #[test]
    fn test_earliest_of_many_fires_first() {
        testing::boot();
        let late = Timer::for_current();
        let early = Timer::for_current();
        late.set_after(Duration::from_millis(200));
        early.set_after(Duration::from_millis(5));
        wait_until_unlocked(|| early.expired());
        assert!(late.armed());
        late.cancel();
    }

    #[test]
    fn test_drop_removes_from_list() {
        let timer = Timer::for_current();
        timer.set_after(Duration::from_secs(3600));
        let key = timer.inner.key();
        assert!(TIMERS.lock().contains_key(&key));
        drop(timer);
        assert!(!TIMERS.lock().contains_key(&key));
    }
}
