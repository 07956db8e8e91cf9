//! # Clock-Event Device
//!
//! One system-wide event source with two channels:
//!
//! - a one-shot channel programmed with an absolute deadline, delivered as
//!   [`ClockEventCallback::fired`]
//! - a periodic channel, delivered as [`ClockEventCallback::tick`]
//!
//! Callbacks run on the device's own host thread with no device lock held,
//! so they may reprogram the device.

use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::clock;
use crate::{HalError, HalResult};

/// Receiver of clock events
pub trait ClockEventCallback: Send + Sync {
    /// The one-shot deadline has passed
    fn fired(&self);

    /// A periodic tick
    fn tick(&self) {}
}

/// Periodic channel state
#[derive(Debug, Clone, Copy)]
struct Periodic {
    interval: Duration,
    next: Duration,
}

#[derive(Default)]
struct DeviceState {
    callback: Option<Arc<dyn ClockEventCallback>>,
    deadline: Option<Duration>,
    periodic: Option<Periodic>,
}

/// The clock-event device
pub struct ClockEvent {
    state: Mutex<DeviceState>,
    cond: Condvar,
    started: Once,
    start_error: OnceLock<HalError>,
}

impl core::fmt::Debug for ClockEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("ClockEvent")
            .field("deadline", &state.deadline)
            .field("periodic", &state.periodic)
            .field("started", &self.started.is_completed())
            .finish()
    }
}

static DEVICE: OnceLock<ClockEvent> = OnceLock::new();

/// Get the system clock-event device
pub fn clock_event() -> &'static ClockEvent {
    DEVICE.get_or_init(ClockEvent::new)
}

impl ClockEvent {
    fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            cond: Condvar::new(),
            started: Once::new(),
            start_error: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    /// Install the event receiver, replacing any previous one
    pub fn set_callback(&self, callback: Arc<dyn ClockEventCallback>) {
        self.lock().callback = Some(callback);
    }

    /// Program the one-shot channel for an absolute uptime `deadline`
    ///
    /// Replaces any deadline programmed before.
    pub fn set(&self, deadline: Duration) {
        self.lock().deadline = Some(deadline);
        self.cond.notify_one();
    }

    /// Disarm the one-shot channel
    pub fn cancel(&self) {
        self.lock().deadline = None;
        self.cond.notify_one();
    }

    /// Currently programmed one-shot deadline
    pub fn deadline(&self) -> Option<Duration> {
        self.lock().deadline
    }

    /// Program the periodic channel; `None` or a zero interval stops it
    pub fn set_periodic(&self, interval: Option<Duration>) {
        let periodic = interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| Periodic {
                interval,
                next: clock::uptime() + interval,
            });
        self.lock().periodic = periodic;
        self.cond.notify_one();
    }

    /// Start delivering events
    ///
    /// Only the first call creates the device thread; later calls report the
    /// outcome of the first.
    pub fn start(&'static self) -> HalResult<()> {
        self.started.call_once(|| {
            let spawned = std::thread::Builder::new()
                .name("clockevent".into())
                .spawn(move || self.run());
            if spawned.is_err() {
                let _ = self.start_error.set(HalError::ClockEventUnavailable);
            } else {
                log::debug!("clockevent: device started");
            }
        });

        match self.start_error.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            let now = clock::uptime();

            let fire = match state.deadline {
                Some(deadline) if deadline <= now => {
                    state.deadline = None;
                    true
                },
                _ => false,
            };

            let tick = match state.periodic.as_mut() {
                Some(periodic) if periodic.next <= now => {
                    periodic.next += periodic.interval;
                    if periodic.next <= now {
                        // Fell behind; skip the lost ticks.
                        periodic.next = now + periodic.interval;
                    }
                    true
                },
                _ => false,
            };

            if fire || tick {
                if let Some(callback) = state.callback.clone() {
                    MutexGuard::unlocked(&mut state, || {
                        if fire {
                            callback.fired();
                        }
                        if tick {
                            callback.tick();
                        }
                    });
                }
                continue;
            }

            let next = match (state.deadline, state.periodic.map(|p| p.next)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match next {
                Some(at) => {
                    self.cond.wait_for(&mut state, at.saturating_sub(now));
                },
                None => self.cond.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_programming_without_start() {
        let dev = ClockEvent::new();
        assert_eq!(dev.deadline(), None);
        dev.set(Duration::from_secs(5));
        assert_eq!(dev.deadline(), Some(Duration::from_secs(5)));
        dev.cancel();
        assert_eq!(dev.deadline(), None);
    }

    struct Counting {
        fired: AtomicUsize,
    }

    impl ClockEventCallback for Counting {
        fn fired(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_one_shot_delivery() {
        let dev: &'static ClockEvent = Box::leak(Box::new(ClockEvent::new()));
        let counter = Arc::new(Counting {
            fired: AtomicUsize::new(0),
        });
        dev.set_callback(counter.clone());
        dev.start().unwrap();
        dev.set(clock::uptime() + Duration::from_millis(5));

        let mut waited = 0;
        while counter.fired.load(Ordering::SeqCst) == 0 && waited < 2000 {
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert_eq!(counter.fired.load(Ordering::SeqCst), 1);
        assert_eq!(dev.deadline(), None);
    }
}
