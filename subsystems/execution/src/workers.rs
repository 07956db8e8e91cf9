//! # Per-CPU Worker Dispatch
//!
//! A [`WorkerItem`] is a handler plus one "has work" bit per CPU. Signalling
//! an item on a CPU sets its bit and wakes that CPU's worker thread, which
//! runs every item with a pending bit on that CPU.
//!
//! Worker threads are created by a CPU-online notifier, one per CPU, pinned
//! to it. Work signalled before a worker is ready is not lost: a new worker
//! starts with a pass over all items.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Once, RwLock};
use unisched_hal::MAX_CPUS;

use crate::cpu::{self, Cpu};
use crate::percpu::DynamicPerCpu;
use crate::thread::{Attr, Thread};
use crate::wait::wait_until_unlocked;

type Handler = Box<dyn Fn() + Send + Sync + 'static>;

/// A unit of per-CPU deferred work
pub struct WorkerItem {
    handler: Handler,
    have_work: [AtomicBool; MAX_CPUS],
}

impl fmt::Debug for WorkerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: Vec<usize> = (0..MAX_CPUS).filter(|&c| self.pending_on(c)).collect();
        f.debug_struct("WorkerItem")
            .field("pending", &pending)
            .finish_non_exhaustive()
    }
}

static ITEMS: RwLock<Vec<Arc<WorkerItem>>> = RwLock::new(Vec::new());

impl WorkerItem {
    /// Register `handler` with every CPU's worker
    pub fn register<F>(handler: F) -> Arc<WorkerItem>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let item = Arc::new(WorkerItem {
            handler: Box::new(handler),
            have_work: core::array::from_fn(|_| AtomicBool::new(false)),
        });
        ITEMS.write().push(item.clone());
        item
    }

    /// Request a run of the handler on `cpu`
    ///
    /// Returns whether the CPU's worker was woken; if it is not running yet
    /// the request is kept and served once it starts.
    pub fn signal(&self, cpu: &Cpu) -> bool {
        log::trace!("workers: signal cpu{}", cpu.id());
        self.have_work[cpu.id()].store(true, Ordering::SeqCst);
        signal_worker(cpu)
    }

    /// Whether a run is pending on `cpu`
    pub fn have_work(&self, cpu: &Cpu) -> bool {
        self.pending_on(cpu.id())
    }

    /// Drop a pending request for `cpu`
    pub fn clear_work(&self, cpu: &Cpu) {
        self.have_work[cpu.id()].store(false, Ordering::SeqCst);
    }

    /// Record that the handler ran on `cpu`
    pub fn set_finished(&self, cpu: &Cpu) {
        log::trace!("workers: finished on cpu{}", cpu.id());
    }

    fn pending_on(&self, cpu: usize) -> bool {
        self.have_work[cpu].load(Ordering::SeqCst)
    }
}

// =============================================================================
// Worker threads
// =============================================================================

struct Worker {
    duty: AtomicBool,
    ready: AtomicBool,
    thread: Once<Arc<Thread>>,
}

static WORKERS: Once<DynamicPerCpu<Worker>> = Once::new();

fn signal_worker(cpu: &Cpu) -> bool {
    let Some(workers) = WORKERS.get() else {
        return false;
    };
    let worker = workers.for_cpu(cpu);
    if !worker.ready.load(Ordering::SeqCst) {
        return false;
    }
    worker.duty.store(true, Ordering::SeqCst);
    match worker.thread.get() {
        Some(thread) => {
            thread.wake();
            true
        },
        None => false,
    }
}

/// Set up the per-CPU worker slots and the online hook
pub(crate) fn init() {
    WORKERS.call_once(|| {
        DynamicPerCpu::new(|_| Worker {
            duty: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            thread: Once::new(),
        })
    });
    cpu::register_notifier(start_worker);
}

fn start_worker(cpu: &'static Cpu) {
    let Some(workers) = WORKERS.get() else {
        return;
    };
    let worker = workers.for_cpu(cpu);
    worker.duty.store(true, Ordering::SeqCst);

    let id = cpu.id();
    let attr = Attr::new().pin(id).name(format!("percpu{}", id));
    let thread = match Thread::new(move || run_worker(cpu), attr) {
        Ok(thread) => thread,
        Err(err) => {
            log::error!("workers: cannot create worker for cpu{}: {}", id, err);
            return;
        },
    };
    worker.thread.call_once(|| thread.clone());
    thread.detach();
    if let Err(err) = thread.start() {
        log::error!("workers: cannot start worker for cpu{}: {}", id, err);
    }
}

fn run_worker(cpu: &'static Cpu) {
    let Some(workers) = WORKERS.get() else {
        return;
    };
    let worker = workers.for_cpu(cpu);
    worker.ready.store(true, Ordering::SeqCst);
    log::debug!("workers: cpu{} worker ready", cpu.id());

    loop {
        wait_until_unlocked(|| worker.duty.load(Ordering::SeqCst));
        worker.duty.store(false, Ordering::SeqCst);

        let items: Vec<Arc<WorkerItem>> = ITEMS.read().clone();
        for item in items {
            if item.have_work(cpu) {
                item.clear_work(cpu);
                log::trace!("workers: invoke on cpu{}", cpu.id());
                (item.handler)();
                item.set_finished(cpu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use core::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_handler_runs_on_signalled_cpu() {
        testing::boot();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (r, s) = (runs.clone(), seen.clone());
        let item = WorkerItem::register(move || {
            s.store(cpu::current_id(), Ordering::SeqCst);
            r.fetch_add(1, Ordering::SeqCst);
        });

        let target = cpu::by_id(2);
        let ready = || {
            WORKERS
                .get()
                .is_some_and(|w| w.for_cpu(target).ready.load(Ordering::SeqCst))
        };
        assert!(wait_for(ready));
        assert!(item.signal(target));
        assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!item.have_work(target));
    }

    #[test]
    fn test_signals_on_every_cpu() {
        testing::boot();
        let mask = Arc::new(AtomicUsize::new(0));
        let m = mask.clone();
        let item = WorkerItem::register(move || {
            m.fetch_or(1 << cpu::current_id(), Ordering::SeqCst);
        });

        for cpu in cpu::cpus() {
            item.signal(cpu);
        }
        let all = (1 << testing::CPUS) - 1;
        assert!(wait_for(|| mask.load(Ordering::SeqCst) == all));
    }

    #[test]
    fn test_clear_work_drops_request() {
        testing::boot();
        let item = WorkerItem::register(|| {});
        let cpu = cpu::by_id(1);
        item.have_work[cpu.id()].store(true, Ordering::SeqCst);
        item.clear_work(cpu);
        assert!(!item.have_work(cpu));
    }
}
