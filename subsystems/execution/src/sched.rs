//! # Scheduler Core
//!
//! Per-CPU fair scheduling on weighted runtime. A CPU runs its `current`
//! thread until that thread blocks, yields, migrates, finishes, or is
//! preempted at a safe point after a tick requested a reschedule. The next
//! thread is always the head of the CPU's ready queue, which holds the
//! thread with the least runtime; with an empty queue the CPU goes idle and
//! the next wake-up on it dispatches directly.
//!
//! ## Runtime
//!
//! A running thread accrues `priority` nanoseconds of runtime per nanosecond
//! on the CPU. The tick preempts it only once its runtime exceeds the head's
//! by more than [`SchedConfig::hysteresis`](crate::SchedConfig::hysteresis),
//! so two busy threads do not thrash. Runtime is kept relative to a per-CPU
//! floor, and moves with the thread when it migrates.
//!
//! ## Locking
//!
//! Each CPU's run queue has its own lock. No path holds two run-queue locks
//! at once, and every lock is released before a context is resumed.
//!
//! ## Hosted switching
//!
//! A switch publishes the new `current` under the run-queue lock, drops the
//! lock, resumes the incoming context and parks the outgoing one until the
//! scheduler marks it `Running` again.

use alloc::sync::Arc;

use unisched_hal::{clock, context};

use crate::cpu::{self, Cpu, CpuFlags, CpuRegistry, RunQueue};
use crate::thread::{Status, Thread};

// =============================================================================
// Dispatch helpers
// =============================================================================

/// Uptime in nanoseconds
fn now() -> u64 {
    clock::uptime().as_nanos() as u64
}

/// Install `next` as the CPU's current thread, or mark the CPU idle
fn install(cpu: &Cpu, rq: &mut RunQueue, next: Option<Arc<Thread>>) -> Option<Arc<Thread>> {
    match &next {
        Some(thread) => {
            rq.advance(thread);
            thread.start_slice(now());
            thread.status_cell().store(Status::Running);
            thread.stats().switches.incr();
            cpu.stats().switches.incr();
            cpu.clear_flag(CpuFlags::IDLE);
        },
        None => {
            cpu.set_flag(CpuFlags::IDLE);
            cpu.stats().idle_entries.incr();
        },
    }
    rq.current = next.clone();
    next
}

/// Put a `Ready` thread arriving with runtime `lag` on `cpu`: dispatched at
/// once if the CPU is idle, queued by runtime otherwise
fn enqueue(cpu: &Cpu, thread: Arc<Thread>, lag: u64) {
    let mut rq = cpu.rq.lock();
    rq.rebase(&thread, lag);
    if rq.current.is_none() {
        let next = install(cpu, &mut rq, Some(thread));
        drop(rq);
        if let Some(next) = next {
            next.context.resume();
        }
    } else {
        rq.push(thread);
    }
}

/// Hand the CPU to `next` (if any) and park `me` until it is dispatched again
fn switch_out(me: &Thread, next: Option<Arc<Thread>>) {
    if let Some(next) = next {
        context::switch_to(&me.context, &next.context);
    }
    me.park();
}

// =============================================================================
// Wake / wait
// =============================================================================

/// Wake `thread` if it is `Waiting`
pub(crate) fn wake(thread: &Arc<Thread>) {
    if !thread.is_bound() {
        if thread.status_cell().transition(Status::Waiting, Status::Ready) {
            thread.context.resume();
        }
        return;
    }

    loop {
        let cpu_id = thread.cpu_id();
        let cpu = cpu::by_id(cpu_id);
        let mut rq = cpu.rq.lock();
        if thread.cpu_id() != cpu_id {
            // Migrated between the read and the lock.
            continue;
        }
        if !thread.status_cell().transition(Status::Waiting, Status::Ready) {
            return;
        }
        if rq.is_current(thread) {
            // Still on its way out of wait(): it will be re-dispatched in place.
            return;
        }
        rq.rebase(thread, rq.lag(thread));
        if rq.current.is_none() {
            let next = install(cpu, &mut rq, Some(thread.clone()));
            drop(rq);
            if let Some(next) = next {
                next.context.resume();
            }
        } else {
            rq.push(thread.clone());
        }
        return;
    }
}

/// Mark the calling thread `Waiting` ahead of a predicate check
pub(crate) fn prepare_wait(me: &Thread) {
    if !me.status_cell().transition(Status::Running, Status::Waiting) {
        panic!(
            "thread {}: wait from status {}, expected running",
            me.id(),
            me.status()
        );
    }
}

/// Return the calling thread to `Running` after a wait
///
/// Covers both a wait that never blocked and a wake-up that raced with the
/// predicate check.
pub(crate) fn stop_wait(me: &Thread) {
    if me.status_cell().transition(Status::Waiting, Status::Running) {
        return;
    }
    // Woken while still current: re-dispatched in place.
    me.status_cell().transition(Status::Ready, Status::Running);
}

/// Block the calling thread until it is woken
///
/// The thread must have gone through [`prepare_wait`].
pub(crate) fn wait(me: &Arc<Thread>) {
    if !me.is_bound() {
        while me.status() == Status::Waiting {
            me.context.suspend();
        }
        return;
    }

    let cpu = me.cpu();
    let mut rq = cpu.rq.lock();
    if me.status() != Status::Waiting {
        // Woken before the CPU could be given away.
        return;
    }
    me.charge(now());
    let next = rq.queue.pop_front();
    let next = install(cpu, &mut rq, next);
    drop(rq);
    switch_out(me, next);
}

// =============================================================================
// Voluntary and involuntary switches
// =============================================================================

/// Hand the CPU to the head of the ready queue and requeue the calling
/// thread by its runtime
fn reschedule(me: &Arc<Thread>, preempted: bool) {
    let cpu = me.cpu();
    cpu.clear_flag(CpuFlags::NEED_RESCHED);

    let mut rq = cpu.rq.lock();
    let Some(next) = rq.queue.pop_front() else {
        return;
    };
    me.charge(now());
    me.status_cell().store(Status::Ready);
    rq.push(me.clone());
    if preempted {
        me.stats().preemptions.incr();
        cpu.stats().preemptions.incr();
    }
    let next = install(cpu, &mut rq, Some(next));
    drop(rq);
    switch_out(me, next);
}

/// Voluntary yield of the calling thread
///
/// With preemption disabled the yield is deferred to the outermost
/// `preempt_enable()`.
pub(crate) fn yield_now() {
    let me = Thread::current();
    if !me.is_bound() {
        unisched_hal::cpu::relax();
        return;
    }
    if me.preempt_count() > 0 {
        me.cpu().request_reschedule();
        return;
    }
    reschedule(&me, false);
}

/// Safe point: honour a pending reschedule on the caller's CPU
pub(crate) fn preempt_check(me: &Arc<Thread>) {
    if !me.is_bound() || me.status() != Status::Running {
        return;
    }
    if !me.cpu().need_resched() {
        return;
    }
    reschedule(me, true);
}

// =============================================================================
// Completion
// =============================================================================

/// Retire the calling thread and hand its CPU on
pub(crate) fn complete(me: &Arc<Thread>) {
    crate::thread::registry::remove(me);

    let cpu = me.cpu();
    let mut rq = cpu.rq.lock();
    me.charge(now());
    me.status_cell().store(Status::Terminated);
    let next = rq.queue.pop_front();
    let next = install(cpu, &mut rq, next);
    drop(rq);

    me.mark_completed();
    for joiner in me.joiners() {
        joiner.wake();
    }

    log::debug!("thread {} '{}': terminated on cpu{}", me.id(), me.name(), cpu.id());
    if let Some(next) = next {
        next.context.resume();
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Move the calling thread to `target` and pin it there
///
/// The caller has checked that migration is enabled.
pub(crate) fn pin(me: &Arc<Thread>, target: &'static Cpu) {
    if me.preempt_count() > 0 {
        panic!("thread {}: pin() with preemption disabled", me.id());
    }
    me.set_pinned(true);

    let source = me.cpu();
    if source.id() == target.id() {
        return;
    }

    let mut rq = source.rq.lock();
    me.charge(now());
    let lag = rq.lag(me);
    me.status_cell().store(Status::Ready);
    let next = rq.queue.pop_front();
    let next = install(source, &mut rq, next);
    me.set_cpu(target.id());
    drop(rq);

    me.stats().migrations.incr();
    log::debug!("thread {}: pinned, cpu{} -> cpu{}", me.id(), source.id(), target.id());

    enqueue(target, me.clone(), lag);
    switch_out(me, next);
}

// =============================================================================
// Tick and load balancing
// =============================================================================

/// Periodic tick
///
/// Requests a reschedule on every CPU whose running thread has pulled ahead
/// of the head of its ready queue by more than the hysteresis, then runs the
/// load balancer.
pub(crate) fn tick() {
    let Some(registry) = cpu::try_registry() else {
        return;
    };
    let hysteresis = registry.config().hysteresis.as_nanos() as u64;
    let at = now();
    for cpu in registry.cpus() {
        let contended = {
            let rq = cpu.rq.lock();
            match (&rq.current, rq.queue.front()) {
                (Some(current), Some(head)) => {
                    current.runtime_at(at) > head.runtime().saturating_add(hysteresis)
                },
                _ => false,
            }
        };
        if contended {
            cpu.request_reschedule();
        }
    }
    if registry.config().load_balance {
        balance(registry);
    }
}

/// Let idle CPUs take work from the busiest CPU
fn balance(registry: &CpuRegistry) {
    for target in registry.cpus().iter().filter(|cpu| cpu.is_online()) {
        let idle = {
            let rq = target.rq.lock();
            rq.current.is_none() && rq.queue.is_empty()
        };
        if !idle {
            continue;
        }

        let Some(source) = busiest(registry, target.id()) else {
            return;
        };

        let stolen = {
            let mut rq = source.rq.lock();
            rq.queue
                .iter()
                .position(|t| t.migratable() && !t.pinned())
                .and_then(|pos| rq.queue.remove(pos))
                .map(|thread| {
                    let lag = rq.lag(&thread);
                    (thread, lag)
                })
        };

        if let Some((thread, lag)) = stolen {
            thread.set_cpu(target.id());
            thread.stats().migrations.incr();
            log::debug!(
                "balance: thread {} cpu{} -> cpu{}",
                thread.id(),
                source.id(),
                target.id()
            );
            enqueue(target, thread, lag);
        }
    }
}

/// CPU with the longest ready queue, other than `exclude`
fn busiest(registry: &CpuRegistry, exclude: usize) -> Option<&Cpu> {
    registry
        .cpus()
        .iter()
        .filter(|cpu| cpu.id() != exclude)
        .map(|cpu| (cpu, cpu.rq.lock().queue.len()))
        .filter(|&(_, len)| len > 0)
        .max_by_key(|&(_, len)| len)
        .map(|(cpu, _)| cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::thread::PRIORITY_DEFAULT;
    use crate::{Attr, MigrationGuard, Semaphore};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::vec::Vec;

    #[test]
    fn test_yield_with_empty_queue_keeps_running() {
        testing::boot();
        let t = Thread::new(
            || {
                let me = Thread::current();
                for _ in 0..10 {
                    Thread::yield_now();
                    assert_eq!(me.status(), Status::Running);
                }
            },
            Attr::new().pin(3),
        )
        .unwrap();
        t.start().unwrap();
        t.join();
    }

    #[test]
    fn test_equal_runtimes_run_in_arrival_order() {
        testing::boot();
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));

        // The first thread holds CPU 2 until every other one is queued.
        let g = gate.clone();
        let first = Thread::new(move || { g.wait(1, None); }, Attr::new().pin(2)).unwrap();
        first.start().unwrap();

        let threads: Vec<_> = (0..5)
            .map(|i| {
                let o = order.clone();
                let t = Thread::new(move || o.lock().push(i), Attr::new().pin(2)).unwrap();
                t.start().unwrap();
                t
            })
            .collect();

        gate.post(1);
        first.join();
        for t in &threads {
            t.join();
        }
        assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_wake_is_noop_unless_waiting() {
        testing::boot();
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let t = Thread::new(move || { g.wait(1, None); }, Attr::new()).unwrap();
        t.wake();
        assert_eq!(t.status(), Status::Unstarted);
        t.start().unwrap();
        gate.post(1);
        t.join();
        t.wake();
        assert_eq!(t.status(), Status::Terminated);
    }

    #[test]
    fn test_tick_requests_reschedule_on_contended_cpu() {
        testing::boot();
        let spins = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        // Two compute-bound threads on one CPU only make progress together if
        // the tick preempts them at their safe points.
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let (s, st) = (spins.clone(), stop.clone());
                let t = Thread::new(
                    move || {
                        let mut mine = 0;
                        while !st.load(Ordering::SeqCst) {
                            mine += 1;
                            if mine == 1 {
                                s.fetch_add(1, Ordering::SeqCst);
                            }
                            crate::preempt_point();
                        }
                    },
                    Attr::new().pin(3),
                )
                .unwrap();
                t.start().unwrap();
                t
            })
            .collect();

        while spins.load(Ordering::SeqCst) < 2 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        stop.store(true, Ordering::SeqCst);
        for t in &threads {
            t.join();
        }
        assert!(threads.iter().any(|t| t.stats().preemptions.get() > 0));
    }

    #[test]
    fn test_lower_priority_value_gets_more_cpu() {
        testing::boot();
        let stop = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = [PRIORITY_DEFAULT, 4.0]
            .into_iter()
            .map(|priority| {
                let st = stop.clone();
                let t = Thread::new(
                    move || {
                        while !st.load(Ordering::SeqCst) {
                            crate::preempt_point();
                        }
                    },
                    Attr::new().pin(3).priority(priority),
                )
                .unwrap();
                t.start().unwrap();
                t
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(400));
        stop.store(true, Ordering::SeqCst);
        for t in &threads {
            t.join();
        }

        let favoured = threads[0].stats().cpu_time.get();
        let weighted = threads[1].stats().cpu_time.get();
        assert!(weighted > 0, "priority 4 thread never ran");
        assert!(
            favoured > weighted * 3 / 2,
            "cpu time {} vs {} does not follow priority",
            favoured,
            weighted
        );
    }

    #[test]
    fn test_balancer_skips_migration_disabled() {
        testing::boot();
        let release = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(spin::Mutex::new(Vec::new()));

        // Partner keeps CPU 0 contended so the subject sits in the ready queue.
        let r = release.clone();
        let partner = Thread::new(
            move || {
                while !r.load(Ordering::SeqCst) {
                    Thread::yield_now();
                }
            },
            Attr::new().pin(0),
        )
        .unwrap();

        let (r, s) = (release.clone(), seen.clone());
        let subject = Thread::new(
            move || {
                Thread::unpin();
                let _m = MigrationGuard::new();
                while !r.load(Ordering::SeqCst) {
                    s.lock().push(Thread::current().cpu_id());
                    Thread::yield_now();
                }
            },
            Attr::new().pin(0),
        )
        .unwrap();

        partner.start().unwrap();
        subject.start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(60));
        release.store(true, Ordering::SeqCst);
        partner.join();
        subject.join();

        assert!(!seen.lock().is_empty());
        assert!(seen.lock().iter().all(|&cpu| cpu == 0));
        assert_eq!(subject.stats().migrations.get(), 0);
    }

    #[test]
    fn test_idle_cpu_steals_queued_thread() {
        testing::boot();
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        // Hog CPU 0 with preemption disabled so nothing queued there can run.
        let (r, st) = (release.clone(), started.clone());
        let hog = Thread::new(
            move || {
                let _p = crate::PreemptGuard::new();
                st.store(true, Ordering::SeqCst);
                while !r.load(Ordering::SeqCst) {
                    unisched_hal::cpu::relax();
                }
            },
            Attr::new().pin(0),
        )
        .unwrap();
        hog.start().unwrap();
        while !started.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let ran_on = Arc::new(AtomicUsize::new(usize::MAX));
        let o = ran_on.clone();
        let victim = Thread::new(
            move || o.store(Thread::current().cpu_id(), Ordering::SeqCst),
            Attr::new().pin(0),
        )
        .unwrap();
        victim.set_pinned(false);
        victim.start().unwrap();

        victim.join();
        release.store(true, Ordering::SeqCst);
        hog.join();

        assert_ne!(ran_on.load(Ordering::SeqCst), 0);
        assert_eq!(victim.stats().migrations.get(), 1);
    }
}
