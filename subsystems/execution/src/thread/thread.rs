//! # Threads
//!
//! A [`Thread`] couples an execution context with its scheduling state: home
//! CPU, status, preemption and migration nesting counters, pin and interrupt
//! flags, a priority with its weighted runtime, and the set of joiners.
//!
//! Host threads that never went through [`Thread::new`] (the boot context,
//! test harness threads) get an *unbound* record on first use of
//! [`Thread::current`]. Unbound threads are homed on the boot CPU; they can
//! block, be woken and own timers, but they are never queued on a CPU.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use spin::Mutex;
use unisched_hal::context::{self, Context};
use unisched_hal::{clock, tls};

use super::registry;
use super::states::{AtomicStatus, Status};
use crate::cpu::{self, Cpu};
use crate::error::{SchedError, SchedResult};
use crate::sched;
use crate::stats::StatCounter;
use crate::timer::Timer;
use crate::wait;

// =============================================================================
// Identifiers
// =============================================================================

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u32);

impl ThreadId {
    /// Raw value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Priority of a thread that does not ask for one
///
/// Runtime accrues at `priority` times wall-clock time, and the thread with
/// the least runtime runs first: a thread at priority 2.0 gets half the CPU
/// of one at 1.0 when both are busy.
pub const PRIORITY_DEFAULT: f32 = 1.0;

fn valid_priority(priority: f32) -> bool {
    priority.is_finite() && priority > 0.0
}

// =============================================================================
// Attributes
// =============================================================================

/// Thread creation attributes
#[derive(Debug, Clone, Default)]
pub struct Attr {
    pub(crate) pinned_cpu: Option<usize>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) detached: bool,
    pub(crate) name: Option<String>,
    pub(crate) priority: Option<f32>,
}

impl Attr {
    /// Default attributes
    pub fn new() -> Self {
        Self::default()
    }

    /// Run on `cpu` and never migrate
    pub fn pin(mut self, cpu: usize) -> Self {
        self.pinned_cpu = Some(cpu);
        self
    }

    /// Stack size in bytes
    pub fn stack(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Start detached
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Thread name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Scheduling priority; lower runs more
    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = Some(priority);
        self
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-thread statistics
#[derive(Debug, Default)]
pub struct ThreadStats {
    /// Times the thread was switched in
    pub switches: StatCounter,
    /// Involuntary switches out
    pub preemptions: StatCounter,
    /// Moves to another CPU
    pub migrations: StatCounter,
    /// Nanoseconds spent running
    pub cpu_time: StatCounter,
}

// =============================================================================
// Thread
// =============================================================================

type ThreadFn = Box<dyn FnOnce() + Send + 'static>;

/// A thread
pub struct Thread {
    id: ThreadId,
    name: String,
    bound: bool,
    func: Mutex<Option<ThreadFn>>,
    pub(crate) context: Context,
    status: AtomicStatus,
    cpu: AtomicUsize,
    preempt_counter: AtomicU32,
    migration_counter: AtomicU32,
    pinned: AtomicBool,
    interrupted: AtomicBool,
    detached: AtomicBool,
    completed: AtomicBool,
    joiners: Mutex<Vec<Arc<Thread>>>,
    /// `f32` bits
    priority: AtomicU32,
    /// Weighted nanoseconds, on the home CPU's scale
    runtime: AtomicU64,
    /// Uptime in nanoseconds at the last dispatch or charge
    slice_start: AtomicU64,
    stats: ThreadStats,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("cpu", &self.cpu_id())
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl Thread {
    fn build(id: ThreadId, name: String, bound: bool, func: Option<ThreadFn>, cpu: usize) -> Self {
        Self {
            id,
            name,
            bound,
            func: Mutex::new(func),
            context: Context::new(),
            status: AtomicStatus::new(Status::Unstarted),
            cpu: AtomicUsize::new(cpu),
            preempt_counter: AtomicU32::new(0),
            migration_counter: AtomicU32::new(0),
            pinned: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            joiners: Mutex::new(Vec::new()),
            priority: AtomicU32::new(PRIORITY_DEFAULT.to_bits()),
            runtime: AtomicU64::new(0),
            slice_start: AtomicU64::new(0),
            stats: ThreadStats::default(),
        }
    }

    /// Create a thread running `func`; it does not run until [`start`](Self::start)
    pub fn new<F>(func: F, attr: Attr) -> SchedResult<Arc<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        let registry = cpu::try_registry().ok_or(SchedError::NotInitialized)?;
        if let Some(pin) = attr.pinned_cpu {
            if registry.cpu(pin).is_none() {
                return Err(SchedError::InvalidCpu(pin));
            }
        }
        let priority = attr.priority.unwrap_or(PRIORITY_DEFAULT);
        if !valid_priority(priority) {
            return Err(SchedError::InvalidPriority);
        }

        let id = registry::allocate_id();
        let name = attr.name.unwrap_or_else(|| format!("thread{}", id));
        let home = attr.pinned_cpu.unwrap_or_else(|| registry.pick_cpu());

        let thread = Arc::new(Thread::build(id, name, true, Some(Box::new(func)), home));
        thread.pinned.store(attr.pinned_cpu.is_some(), Ordering::Relaxed);
        thread.detached.store(attr.detached, Ordering::Relaxed);
        thread.priority.store(priority.to_bits(), Ordering::Relaxed);
        registry::insert(&thread);

        let stack = attr.stack_size.unwrap_or(registry.config().stack_size);
        let entry = thread.clone();
        if let Err(err) = context::spawn(&thread.name, stack, move || entry.host_main()) {
            registry::remove(&thread);
            return Err(err.into());
        }

        log::debug!("thread {} '{}': created, home cpu{}", thread.id, thread.name, home);
        Ok(thread)
    }

    /// Create and start a thread with default attributes
    pub fn spawn<F>(func: F) -> SchedResult<Arc<Thread>>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = Self::new(func, Attr::new())?;
        thread.start()?;
        Ok(thread)
    }

    /// Body of the host context backing a bound thread
    fn host_main(self: Arc<Self>) {
        let object: tls::CurrentObject = self.clone();
        tls::set_current(Some(object));

        // Parked until the first dispatch.
        self.park();

        let func = self.func.lock().take();
        if let Some(func) = func {
            func();
        }

        sched::complete(&self);
        tls::set_current(None);
    }

    /// Block the host context until the scheduler dispatches this thread
    pub(crate) fn park(&self) {
        while self.status() != Status::Running {
            self.context.suspend();
        }
    }

    /// Make the thread runnable
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        if !self.status.transition(Status::Unstarted, Status::Waiting) {
            return Err(SchedError::AlreadyStarted);
        }
        self.wake();
        Ok(())
    }

    /// The calling thread
    pub fn current() -> Arc<Thread> {
        if let Some(object) = tls::current() {
            if let Ok(thread) = object.downcast::<Thread>() {
                return thread;
            }
        }

        let id = registry::allocate_id();
        let thread = Arc::new(Thread::build(
            id,
            format!("host{}", id),
            false,
            None,
            unisched_hal::cpu::boot_cpu_id(),
        ));
        thread.status.store(Status::Running);
        registry::insert(&thread);
        let object: Arc<dyn Any + Send + Sync> = thread.clone();
        tls::set_current(Some(object));
        thread
    }

    /// Wake the thread if it is waiting; no-op otherwise
    pub fn wake(self: &Arc<Self>) {
        sched::wake(self);
    }

    /// Wait for the thread to finish
    ///
    /// Any number of threads may join the same thread.
    ///
    /// # Panics
    ///
    /// Panics when joining a detached thread or the calling thread itself.
    #[track_caller]
    pub fn join(self: &Arc<Self>) {
        if self.detached.load(Ordering::SeqCst) {
            panic!("thread {}: join() on a detached thread", self.id);
        }
        let me = Thread::current();
        if Arc::ptr_eq(&me, self) {
            panic!("thread {}: join() on itself", self.id);
        }

        self.joiners.lock().push(me.clone());
        wait::wait_until_unlocked(|| self.completed.load(Ordering::SeqCst));
        self.joiners.lock().retain(|j| !Arc::ptr_eq(j, &me));
    }

    /// Let the thread finish without being joined
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Voluntarily give the CPU to the next ready thread
    pub fn yield_now() {
        sched::yield_now();
    }

    /// Sleep for at least `duration`
    pub fn sleep(duration: Duration) {
        Self::sleep_until(clock::uptime() + duration);
    }

    /// Sleep until uptime reaches `deadline`
    pub fn sleep_until(deadline: Duration) {
        let timer = Timer::for_current();
        timer.set(deadline);
        wait::wait_until_unlocked(|| timer.expired());
    }

    /// Move the calling thread to `cpu` and keep it there
    ///
    /// # Panics
    ///
    /// Panics when called with migration disabled.
    #[track_caller]
    pub fn pin(cpu: usize) -> SchedResult<()> {
        let target = cpu::try_registry()
            .ok_or(SchedError::NotInitialized)?
            .cpu(cpu)
            .ok_or(SchedError::InvalidCpu(cpu))?;
        let me = Thread::current();
        if !me.migratable() {
            panic!("thread {}: pin() with migration disabled", me.id);
        }
        if !me.bound {
            return Err(SchedError::Unbound);
        }
        sched::pin(&me, target);
        Ok(())
    }

    /// Let the calling thread migrate again
    pub fn unpin() {
        Thread::current().pinned.store(false, Ordering::SeqCst);
    }

    /// Change the scheduling priority
    ///
    /// Applies to runtime accrued from the next accounting point on.
    ///
    /// # Panics
    ///
    /// Panics unless `priority` is finite and positive.
    #[track_caller]
    pub fn set_priority(&self, priority: f32) {
        if !valid_priority(priority) {
            panic!("thread {}: invalid priority {}", self.id, priority);
        }
        self.priority.store(priority.to_bits(), Ordering::SeqCst);
    }

    /// Scheduling priority
    pub fn priority(&self) -> f32 {
        f32::from_bits(self.priority.load(Ordering::SeqCst))
    }

    /// Weighted runtime, in nanoseconds on the home CPU's scale
    pub fn runtime(&self) -> u64 {
        self.runtime.load(Ordering::SeqCst)
    }

    /// Set the interrupted flag and wake the thread
    pub fn interrupt(self: &Arc<Self>) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Whether the interrupted flag is set
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the interrupted flag
    pub fn clear_interrupted(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    /// Find a live thread by id
    pub fn find_by_id(id: ThreadId) -> Option<Arc<Thread>> {
        registry::find_by_id(id)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Thread id
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status
    #[inline]
    pub fn status(&self) -> Status {
        self.status.load()
    }

    /// Home CPU id
    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    /// Home CPU
    #[track_caller]
    pub fn cpu(&self) -> &'static Cpu {
        cpu::by_id(self.cpu_id())
    }

    /// Whether the thread is pinned to its CPU
    pub fn pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    /// Whether the thread is backed by a scheduler context
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Whether the thread has finished
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether the thread is detached
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Whether the thread may be moved to another CPU
    pub fn migratable(&self) -> bool {
        self.migration_counter.load(Ordering::SeqCst) == 0
    }

    /// Statistics
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    // -------------------------------------------------------------------------
    // Scheduler internals
    // -------------------------------------------------------------------------

    pub(crate) fn status_cell(&self) -> &AtomicStatus {
        &self.status
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::SeqCst);
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn joiners(&self) -> Vec<Arc<Thread>> {
        self.joiners.lock().clone()
    }

    pub(crate) fn set_runtime(&self, runtime: u64) {
        self.runtime.store(runtime, Ordering::SeqCst);
    }

    /// Start a new slice at uptime `now`
    pub(crate) fn start_slice(&self, now: u64) {
        self.slice_start.store(now, Ordering::SeqCst);
    }

    /// Runtime including the slice in progress, as of `now`
    pub(crate) fn runtime_at(&self, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.slice_start.load(Ordering::SeqCst));
        self.runtime().saturating_add(self.weigh(elapsed))
    }

    /// Fold the slice in progress into runtime and statistics
    ///
    /// Called by the running thread with its CPU's run-queue lock held.
    pub(crate) fn charge(&self, now: u64) {
        let elapsed = now.saturating_sub(self.slice_start.swap(now, Ordering::SeqCst));
        self.set_runtime(self.runtime().saturating_add(self.weigh(elapsed)));
        self.stats.cpu_time.add(elapsed);
    }

    fn weigh(&self, elapsed: u64) -> u64 {
        (elapsed as f64 * f64::from(self.priority())) as u64
    }

    pub(crate) fn preempt_count(&self) -> u32 {
        self.preempt_counter.load(Ordering::Relaxed)
    }

    /// Only the thread itself touches its nesting counters.
    pub(crate) fn preempt_inc(&self) {
        self.preempt_counter.fetch_add(1, Ordering::SeqCst);
    }

    #[track_caller]
    pub(crate) fn preempt_dec(&self) -> u32 {
        let count = self.preempt_counter.load(Ordering::SeqCst);
        if count == 0 {
            panic!(
                "thread {}: preempt_enable() without matching preempt_disable()",
                self.id
            );
        }
        self.preempt_counter.store(count - 1, Ordering::SeqCst);
        count - 1
    }

    pub(crate) fn migrate_inc(&self) {
        self.migration_counter.fetch_add(1, Ordering::SeqCst);
    }

    #[track_caller]
    pub(crate) fn migrate_dec(&self) -> u32 {
        let count = self.migration_counter.load(Ordering::SeqCst);
        if count == 0 {
            panic!(
                "thread {}: migrate_enable() without matching migrate_disable()",
                self.id
            );
        }
        self.migration_counter.store(count - 1, Ordering::SeqCst);
        count - 1
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        registry::remove_stale(self.id);
    }
}
