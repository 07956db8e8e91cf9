//! # Preemption and Migration Gates
//!
//! Each thread carries two nesting counters. While the preempt counter is
//! non-zero the thread is never switched out involuntarily; a reschedule
//! requested meanwhile stays pending on the CPU and is honoured by the
//! outermost [`preempt_enable`]. While the migration counter is non-zero the
//! thread stays on its CPU but may still be preempted there.
//!
//! Enabling a gate whose counter is already zero is a fatal error.

use core::marker::PhantomData;

use crate::sched;
use crate::thread::Thread;

// =============================================================================
// Preemption
// =============================================================================

/// Disable preemption of the calling thread
#[inline]
pub fn preempt_disable() {
    Thread::current().preempt_inc();
}

/// Re-enable preemption of the calling thread
///
/// At the outermost level, yields if a reschedule became pending while
/// preemption was disabled.
///
/// # Panics
///
/// Panics if preemption is not disabled.
#[track_caller]
pub fn preempt_enable() {
    let me = Thread::current();
    if me.preempt_dec() == 0 {
        sched::preempt_check(&me);
    }
}

/// Preemption nesting depth of the calling thread
#[inline]
pub fn preempt_count() -> u32 {
    Thread::current().preempt_count()
}

/// Whether the calling thread can be preempted
#[inline]
pub fn preemptable() -> bool {
    preempt_count() == 0
}

/// Honour a pending reschedule if preemption is enabled
///
/// With preemption disabled the request stays pending for
/// [`preempt_enable`].
pub fn preempt_point() {
    let me = Thread::current();
    if me.preempt_count() == 0 {
        sched::preempt_check(&me);
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Keep the calling thread on its current CPU
#[inline]
pub fn migrate_disable() {
    Thread::current().migrate_inc();
}

/// Allow the calling thread to migrate again
///
/// # Panics
///
/// Panics if migration is not disabled.
#[track_caller]
pub fn migrate_enable() {
    Thread::current().migrate_dec();
}

// =============================================================================
// Guards
// =============================================================================

/// Scoped preemption disable
#[derive(Debug)]
#[must_use = "preemption is re-enabled when the guard is dropped"]
pub struct PreemptGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    /// Disable preemption until the guard is dropped
    pub fn new() -> Self {
        preempt_disable();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}

/// Scoped migration disable
#[derive(Debug)]
#[must_use = "migration is re-enabled when the guard is dropped"]
pub struct MigrationGuard {
    _not_send: PhantomData<*const ()>,
}

impl MigrationGuard {
    /// Disable migration until the guard is dropped
    pub fn new() -> Self {
        migrate_disable();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for MigrationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        migrate_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_nesting() {
        assert!(preemptable());
        preempt_disable();
        preempt_disable();
        assert_eq!(preempt_count(), 2);
        preempt_enable();
        assert!(!preemptable());
        preempt_enable();
        assert!(preemptable());
    }

    #[test]
    fn test_guards_restore() {
        {
            let _outer = PreemptGuard::new();
            {
                let _inner = PreemptGuard::new();
                assert_eq!(preempt_count(), 2);
            }
            assert_eq!(preempt_count(), 1);
        }
        assert_eq!(preempt_count(), 0);

        {
            let _m = MigrationGuard::new();
            assert!(!Thread::current().migratable());
        }
        assert!(Thread::current().migratable());
    }

    #[test]
    #[should_panic(expected = "preempt_enable() without matching preempt_disable()")]
    fn test_unbalanced_preempt_enable_panics() {
        preempt_enable();
    }

    #[test]
    #[should_panic(expected = "migrate_enable() without matching migrate_disable()")]
    fn test_unbalanced_migrate_enable_panics() {
        migrate_enable();
    }

    #[test]
    fn test_pending_reschedule_waits_for_outermost_enable() {
        testing::boot();
        // (switches before the outer enable, competitor runs seen then, switches after)
        let observed = Arc::new(Mutex::new((0u64, 0u64, 0u64)));
        let slot = observed.clone();
        let competitor_runs = Arc::new(AtomicU64::new(0));
        let runs = competitor_runs.clone();

        let t = Thread::new(
            move || {
                let me = Thread::current();
                let cpu = me.cpu();

                preempt_disable();
                preempt_disable();
                let counter = runs.clone();
                let competitor = Thread::new(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    crate::Attr::new().pin(cpu.id()),
                )
                .unwrap();
                competitor.start().unwrap();
                cpu.request_reschedule();

                preempt_point();
                preempt_enable();
                let before = me.stats().switches.get();
                let early = runs.load(Ordering::SeqCst);

                preempt_enable();
                let after = me.stats().switches.get();
                *slot.lock().unwrap() = (before, early, after);
                competitor.join();
            },
            crate::Attr::new().pin(1),
        )
        .unwrap();
        t.start().unwrap();
        t.join();

        let (before, early, after) = *observed.lock().unwrap();
        assert_eq!(early, 0, "competitor ran while preemption was disabled");
        assert!(after > before, "deferred reschedule was not honoured");
        assert_eq!(competitor_runs.load(Ordering::SeqCst), 1);
    }
}
