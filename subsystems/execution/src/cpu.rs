//! # CPU Registry
//!
//! Every CPU owns a ready queue ordered by weighted runtime, a current-thread slot (empty while the
//! CPU is idle), a flag word and its copy of the dynamic per-CPU region. The
//! set of CPUs is fixed at boot and lives for the rest of the system's life.
//!
//! ## Notifiers
//!
//! [`register_notifier`] attaches a callback to the "CPU online" event. It
//! fires once for each CPU as it is brought up, and immediately for CPUs that
//! are already online at registration time.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spin::{Mutex, Once};
use unisched_hal::MAX_CPUS;
use unisched_memory::{PerCpuAllocator, PerCpuArea, PERCPU_DYNAMIC_SIZE};

use crate::config::SchedConfig;
use crate::error::{SchedError, SchedResult};
use crate::stats::StatCounter;
use crate::thread::Thread;

// =============================================================================
// CPU Flags
// =============================================================================

bitflags::bitflags! {
    /// Per-CPU flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        /// CPU has been brought up
        const ONLINE = 1 << 0;
        /// No thread is running
        const IDLE = 1 << 1;
        /// The running thread should yield at its next safe point
        const NEED_RESCHED = 1 << 2;
    }
}

// =============================================================================
// Run Queue
// =============================================================================

/// Scheduling state of one CPU, guarded by the CPU's run-queue lock
///
/// Threads are kept in ascending order of weighted runtime, arrival order
/// among equals. `min_runtime` never decreases; threads that arrive from a
/// wait or from another CPU are placed relative to it so that a long sleep
/// earns no more than a place at the head.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    /// Ready threads, lowest runtime first
    pub(crate) queue: VecDeque<Arc<Thread>>,
    /// Thread owning the CPU; `None` while idle
    pub(crate) current: Option<Arc<Thread>>,
    /// Runtime floor of this CPU
    pub(crate) min_runtime: u64,
}

impl RunQueue {
    /// Whether `thread` owns the CPU
    pub(crate) fn is_current(&self, thread: &Arc<Thread>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, thread))
    }

    /// Queue `thread` behind every ready thread with no greater runtime
    pub(crate) fn push(&mut self, thread: Arc<Thread>) {
        let runtime = thread.runtime();
        let pos = self.queue.partition_point(|t| t.runtime() <= runtime);
        self.queue.insert(pos, thread);
    }

    /// Runtime of `thread` in excess of this CPU's floor
    pub(crate) fn lag(&self, thread: &Thread) -> u64 {
        thread.runtime().saturating_sub(self.min_runtime)
    }

    /// Place a thread arriving with `lag` on this CPU's runtime scale
    pub(crate) fn rebase(&self, thread: &Thread, lag: u64) {
        thread.set_runtime(self.min_runtime.saturating_add(lag));
    }

    /// Advance the floor as `next` is dispatched
    pub(crate) fn advance(&mut self, next: &Thread) {
        let lowest = self
            .queue
            .front()
            .map_or(next.runtime(), |head| head.runtime().min(next.runtime()));
        self.min_runtime = self.min_runtime.max(lowest);
    }
}

/// Per-CPU statistics
#[derive(Debug, Default)]
pub struct CpuStats {
    /// Threads switched in
    pub switches: StatCounter,
    /// Involuntary switches
    pub preemptions: StatCounter,
    /// Times the CPU went idle
    pub idle_entries: StatCounter,
}

// =============================================================================
// CPU
// =============================================================================

/// A CPU
pub struct Cpu {
    id: usize,
    pub(crate) rq: Mutex<RunQueue>,
    flags: AtomicU32,
    area: PerCpuArea,
    stats: CpuStats,
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

impl Cpu {
    fn new(id: usize) -> Self {
        Self {
            id,
            rq: Mutex::new(RunQueue::default()),
            flags: AtomicU32::new(CpuFlags::IDLE.bits()),
            area: PerCpuArea::new(PERCPU_DYNAMIC_SIZE),
            stats: CpuStats::default(),
        }
    }

    /// CPU index
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get flags
    pub fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Set flag
    pub(crate) fn set_flag(&self, flag: CpuFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    /// Clear flag
    pub(crate) fn clear_flag(&self, flag: CpuFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    /// Whether the CPU is online
    pub fn is_online(&self) -> bool {
        self.flags().contains(CpuFlags::ONLINE)
    }

    /// Whether the CPU has no running thread
    pub fn is_idle(&self) -> bool {
        self.flags().contains(CpuFlags::IDLE)
    }

    /// Ask the running thread to yield at its next safe point
    pub fn request_reschedule(&self) {
        self.set_flag(CpuFlags::NEED_RESCHED);
    }

    /// Whether a reschedule is pending
    pub fn need_resched(&self) -> bool {
        self.flags().contains(CpuFlags::NEED_RESCHED)
    }

    /// Threads on this CPU, running or ready
    pub fn load(&self) -> usize {
        let rq = self.rq.lock();
        rq.queue.len() + usize::from(rq.current.is_some())
    }

    /// Thread currently running on this CPU
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.rq.lock().current.clone()
    }

    /// Statistics
    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    /// This CPU's copy of the dynamic per-CPU region
    pub(crate) fn area(&self) -> &PerCpuArea {
        &self.area
    }
}

static_assertions::assert_impl_all!(Cpu: Send, Sync);
static_assertions::assert_impl_all!(Thread: Send, Sync);

// =============================================================================
// Registry
// =============================================================================

/// The set of CPUs and the state shared between them
pub struct CpuRegistry {
    cpus: ArrayVec<Cpu, MAX_CPUS>,
    percpu: PerCpuAllocator,
    config: SchedConfig,
    next_cpu: AtomicUsize,
}

impl fmt::Debug for CpuRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuRegistry")
            .field("cpus", &self.cpus.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static REGISTRY: Once<CpuRegistry> = Once::new();

impl CpuRegistry {
    fn new(config: SchedConfig) -> Self {
        let cpus = (0..config.cpus).map(Cpu::new).collect();
        Self {
            cpus,
            percpu: PerCpuAllocator::new(),
            config,
            next_cpu: AtomicUsize::new(0),
        }
    }

    /// All CPUs
    #[inline]
    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    /// CPU by id
    #[inline]
    pub fn cpu(&self, id: usize) -> Option<&Cpu> {
        self.cpus.get(id)
    }

    /// Number of CPUs
    #[inline]
    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    /// Configuration the scheduler was booted with
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Allocator for the dynamic per-CPU region
    pub fn percpu_allocator(&self) -> &PerCpuAllocator {
        &self.percpu
    }

    /// Pick a home CPU for a new unpinned thread, round-robin over online CPUs
    pub(crate) fn pick_cpu(&self) -> usize {
        let n = self.cpus.len();
        for _ in 0..n {
            let id = self.next_cpu.fetch_add(1, Ordering::Relaxed) % n;
            if self.cpus[id].is_online() {
                return id;
            }
        }
        unisched_hal::cpu::boot_cpu_id()
    }
}

/// Create the registry
pub(crate) fn install(config: SchedConfig) -> SchedResult<&'static CpuRegistry> {
    let mut created = false;
    let registry = REGISTRY.call_once(|| {
        created = true;
        CpuRegistry::new(config)
    });
    if !created {
        return Err(SchedError::AlreadyInitialized);
    }
    log::info!("cpu: registry created with {} cpus", registry.count());
    Ok(registry)
}

/// Get the registry, if the scheduler is initialized
#[inline]
pub fn try_registry() -> Option<&'static CpuRegistry> {
    REGISTRY.get()
}

/// Get the registry
///
/// # Panics
///
/// Panics if the scheduler is not initialized.
#[track_caller]
pub fn registry() -> &'static CpuRegistry {
    match REGISTRY.get() {
        Some(registry) => registry,
        None => panic!("cpu: scheduler used before init()"),
    }
}

/// All CPUs
pub fn cpus() -> &'static [Cpu] {
    registry().cpus()
}

/// CPU by id
#[track_caller]
pub(crate) fn by_id(id: usize) -> &'static Cpu {
    match registry().cpu(id) {
        Some(cpu) => cpu,
        None => panic!("cpu: no cpu {}", id),
    }
}

/// ID of the CPU executing the caller
///
/// Valid before the registry exists: contexts outside the scheduler report
/// the boot CPU.
pub fn current_id() -> usize {
    Thread::current().cpu_id()
}

/// The CPU executing the caller
#[track_caller]
pub fn current() -> &'static Cpu {
    by_id(current_id())
}

// =============================================================================
// Notifiers
// =============================================================================

type Notifier = Arc<dyn Fn(&'static Cpu) + Send + Sync>;

static NOTIFIERS: Mutex<Vec<Notifier>> = Mutex::new(Vec::new());

/// Run `notifier` for every CPU that comes online
///
/// CPUs already online are reported before this returns.
pub fn register_notifier<F>(notifier: F)
where
    F: Fn(&'static Cpu) + Send + Sync + 'static,
{
    let notifier: Notifier = Arc::new(notifier);
    let online: Vec<&'static Cpu> = {
        let mut list = NOTIFIERS.lock();
        list.push(notifier.clone());
        try_registry()
            .map(|registry| registry.cpus().iter().filter(|cpu| cpu.is_online()).collect())
            .unwrap_or_default()
    };
    for cpu in online {
        notifier(cpu);
    }
}

/// Mark `cpu` online and run the notifiers
pub(crate) fn bring_up(cpu: &'static Cpu) {
    let list = {
        let list = NOTIFIERS.lock();
        cpu.set_flag(CpuFlags::ONLINE);
        list.clone()
    };
    log::info!("cpu{}: online", cpu.id());
    for notifier in list {
        notifier(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_registry_after_boot() {
        testing::boot();
        let registry = registry();
        assert_eq!(registry.count(), testing::CPUS);
        for (i, cpu) in cpus().iter().enumerate() {
            assert_eq!(cpu.id(), i);
            assert!(cpu.is_online());
        }
        assert!(registry.cpu(testing::CPUS).is_none());
    }

    #[test]
    fn test_unbound_context_reports_boot_cpu() {
        testing::boot();
        let id = std::thread::spawn(current_id).join().unwrap();
        assert_eq!(id, unisched_hal::cpu::boot_cpu_id());
        assert_eq!(current().id(), unisched_hal::cpu::boot_cpu_id());
    }

    #[test]
    fn test_late_notifier_sees_online_cpus() {
        testing::boot();
        let seen = Arc::new(AtomicUsize::new(0));
        let mask = Arc::new(AtomicUsize::new(0));
        let (s, m) = (seen.clone(), mask.clone());
        register_notifier(move |cpu| {
            s.fetch_add(1, Ordering::SeqCst);
            m.fetch_or(1 << cpu.id(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), testing::CPUS);
        assert_eq!(mask.load(Ordering::SeqCst), (1 << testing::CPUS) - 1);
    }

    #[test]
    fn test_pick_cpu_stays_in_range() {
        testing::boot();
        let registry = registry();
        for _ in 0..testing::CPUS * 4 {
            let id = registry.pick_cpu();
            assert!(id < testing::CPUS);
            assert!(registry.cpus()[id].is_online());
        }
    }

    #[test]
    fn test_running_thread_is_current_on_its_cpu() {
        testing::boot();
        assert!(crate::is_initialized());
        let ok = Arc::new(AtomicUsize::new(0));
        let o = ok.clone();
        let t = Thread::new(
            move || {
                let me = Thread::current();
                let running = current().current_thread();
                if running.is_some_and(|r| Arc::ptr_eq(&r, &me)) && current().id() == 1 {
                    o.store(1, Ordering::SeqCst);
                }
            },
            crate::Attr::new().pin(1),
        )
        .unwrap();
        t.start().unwrap();
        t.join();
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_queue_orders_by_runtime() {
        testing::boot();
        let threads: Vec<_> = [30u64, 10, 20, 10]
            .iter()
            .map(|&runtime| {
                let t = Thread::new(|| {}, crate::Attr::new()).unwrap();
                t.set_runtime(runtime);
                t
            })
            .collect();

        let mut rq = RunQueue::default();
        for t in &threads {
            rq.push(t.clone());
        }
        let order: Vec<_> = rq.queue.iter().map(|t| t.id()).collect();
        // Equal runtimes keep arrival order.
        assert_eq!(
            order,
            [threads[1].id(), threads[3].id(), threads[2].id(), threads[0].id()]
        );
    }

    #[test]
    fn test_run_queue_floor_and_rebase() {
        testing::boot();
        let sleeper = Thread::new(|| {}, crate::Attr::new()).unwrap();
        let runner = Thread::new(|| {}, crate::Attr::new()).unwrap();
        let mut rq = RunQueue::default();

        runner.set_runtime(500);
        rq.advance(&runner);
        assert_eq!(rq.min_runtime, 500);

        // A thread that slept through the runner's slice starts at the floor.
        sleeper.set_runtime(100);
        let lag = rq.lag(&sleeper);
        rq.rebase(&sleeper, lag);
        assert_eq!(sleeper.runtime(), 500);

        // Lag carries across CPUs.
        runner.set_runtime(800);
        let lag = rq.lag(&runner);
        let mut other = RunQueue::default();
        other.min_runtime = 2000;
        other.rebase(&runner, lag);
        assert_eq!(runner.runtime(), 2300);

        // The floor never moves backwards.
        sleeper.set_runtime(0);
        rq.advance(&sleeper);
        assert_eq!(rq.min_runtime, 500);
    }

    #[test]
    fn test_reschedule_flag() {
        let cpu = Cpu::new(7);
        assert!(cpu.is_idle());
        assert!(!cpu.need_resched());
        cpu.request_reschedule();
        assert!(cpu.need_resched());
        cpu.clear_flag(CpuFlags::NEED_RESCHED);
        assert!(!cpu.need_resched());
        assert_eq!(cpu.load(), 0);
    }
}
