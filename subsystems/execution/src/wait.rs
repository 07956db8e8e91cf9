//! # Wait / Wake
//!
//! A waiter marks itself `Waiting`, evaluates its predicate, and blocks only
//! if the predicate is still false. A waker first makes the condition true,
//! then calls [`Thread::wake`]. Whichever order the two interleave in, the
//! waiter either sees the condition or is woken after it blocked, so no
//! wake-up is lost. The predicate is re-evaluated after every wake, which
//! makes spurious wake-ups harmless.

use alloc::sync::Arc;
use core::fmt;

use crate::sched;
use crate::sync::SpinLockGuard;
use crate::thread::Thread;

/// Brackets one predicate evaluation: `Waiting` on entry, `Running` on exit
struct WaitGuard<'a> {
    thread: &'a Thread,
}

impl<'a> WaitGuard<'a> {
    fn new(thread: &'a Thread) -> Self {
        sched::prepare_wait(thread);
        Self { thread }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        sched::stop_wait(self.thread);
    }
}

/// A wait cut short by [`Thread::interrupt`]; holds the re-acquired guard
pub struct Interrupted<G>(G);

impl<G> Interrupted<G> {
    /// Take back the guard
    pub fn into_inner(self) -> G {
        self.0
    }
}

impl<G> fmt::Debug for Interrupted<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupted")
    }
}

#[track_caller]
fn check_can_block(me: &Thread, allowed: u32) {
    let count = me.preempt_count();
    if count > allowed {
        panic!(
            "thread {}: blocking with preemption disabled (count {})",
            me.id(),
            count
        );
    }
}

fn do_wait_until<'a, T, F>(
    mut guard: SpinLockGuard<'a, T>,
    pred: &mut F,
    interruptible: bool,
) -> Result<SpinLockGuard<'a, T>, Interrupted<SpinLockGuard<'a, T>>>
where
    F: FnMut(&mut T) -> bool,
{
    let me = Thread::current();
    check_can_block(&me, 1);
    if interruptible {
        me.clear_interrupted();
    }

    loop {
        let waiter = WaitGuard::new(&me);
        if pred(&mut *guard) {
            return Ok(guard);
        }
        if interruptible && me.interrupted() {
            drop(waiter);
            return Err(Interrupted(guard));
        }

        let lock = guard.spinlock();
        drop(guard);
        sched::wait(&me);
        drop(waiter);
        guard = lock.lock();
    }
}

/// Block until `pred` holds, evaluating it under `guard`'s lock
///
/// The lock is released while the thread is blocked and re-acquired before
/// every evaluation. Returns the guard once `pred` returned `true`.
///
/// # Panics
///
/// Panics if preemption is disabled beyond the held lock.
#[track_caller]
pub fn wait_until<'a, T, F>(guard: SpinLockGuard<'a, T>, mut pred: F) -> SpinLockGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    match do_wait_until(guard, &mut pred, false) {
        Ok(guard) => guard,
        Err(interrupted) => interrupted.into_inner(),
    }
}

/// Like [`wait_until`], but also returns when the thread is interrupted
///
/// The interrupted flag is cleared on entry, so only interrupts that arrive
/// during the wait count.
#[track_caller]
pub fn wait_until_interruptible<'a, T, F>(
    guard: SpinLockGuard<'a, T>,
    mut pred: F,
) -> Result<SpinLockGuard<'a, T>, Interrupted<SpinLockGuard<'a, T>>>
where
    F: FnMut(&mut T) -> bool,
{
    do_wait_until(guard, &mut pred, true)
}

/// Block until `pred` holds, without a lock
///
/// # Panics
///
/// Panics if preemption is disabled.
#[track_caller]
pub fn wait_until_unlocked<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    let me: Arc<Thread> = Thread::current();
    check_can_block(&me, 0);

    loop {
        let _waiter = WaitGuard::new(&me);
        if pred() {
            return;
        }
        sched::wait(&me);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::{Attr, PreemptGuard, SpinLock};
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;

    #[test]
    fn test_wait_returns_immediately_when_true() {
        let lock = SpinLock::new(5u32);
        let guard = wait_until(lock.lock(), |v| *v == 5);
        assert_eq!(*guard, 5);
        drop(guard);
        assert_eq!(Thread::current().status(), crate::Status::Running);
    }

    #[test]
    fn test_wake_across_threads() {
        testing::boot();
        let state = Arc::new(SpinLock::new(0u32));
        let waiter = Thread::current();

        let s = state.clone();
        let producer = Thread::spawn(move || {
            Thread::sleep(Duration::from_millis(5));
            *s.lock() = 42;
            waiter.wake();
        })
        .unwrap();

        let guard = wait_until(state.lock(), |v| *v == 42);
        assert_eq!(*guard, 42);
        drop(guard);
        producer.join();
    }

    #[test]
    fn test_predicate_reevaluated_after_spurious_wake() {
        testing::boot();
        let flag = Arc::new(AtomicBool::new(false));
        let evaluations = Arc::new(SpinLock::new(0u32));
        let (f, e) = (flag.clone(), evaluations.clone());

        let t = Thread::spawn(move || {
            wait_until_unlocked(|| {
                *e.lock() += 1;
                f.load(Ordering::SeqCst)
            });
        })
        .unwrap();

        // Spurious wake-ups: the condition is still false.
        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(2));
            t.wake();
        }
        flag.store(true, Ordering::SeqCst);
        t.wake();
        t.join();
        assert!(*evaluations.lock() >= 2);
    }

    #[test]
    fn test_interruptible_wait() {
        testing::boot();
        let lock = Arc::new(SpinLock::new(false));
        let outcome = Arc::new(SpinLock::new(None));
        let (l, o) = (lock.clone(), outcome.clone());

        let t = Thread::new(
            move || {
                let res = wait_until_interruptible(l.lock(), |ready| *ready);
                *o.lock() = Some(res.is_err());
            },
            Attr::new(),
        )
        .unwrap();
        t.start().unwrap();
        while t.status() != crate::Status::Waiting {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        t.interrupt();
        t.join();
        assert_eq!(*outcome.lock(), Some(true));
    }

    #[test]
    #[should_panic(expected = "blocking with preemption disabled")]
    fn test_wait_with_preemption_disabled_panics() {
        let _p = PreemptGuard::new();
        wait_until_unlocked(|| true);
    }

    #[test]
    #[should_panic(expected = "blocking with preemption disabled")]
    fn test_wait_with_extra_preempt_disable_panics() {
        let lock = SpinLock::new(());
        let _p = PreemptGuard::new();
        let _ = wait_until(lock.lock(), |_| true);
    }
}
