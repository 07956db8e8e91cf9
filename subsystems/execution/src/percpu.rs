//! # Dynamic Per-CPU Variables
//!
//! [`DynamicPerCpu<T>`] reserves one `T` slot at the same offset in every
//! CPU's dynamic area. [`PercpuCounter`] builds a contention-free counter on
//! top of it: each CPU adds to its own word, readers sum all words.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use unisched_memory::PerCpuOffset;

use crate::cpu::{self, Cpu, CpuRegistry};
use crate::error::{SchedError, SchedResult};
use crate::preempt::PreemptGuard;
use crate::thread::Thread;

// =============================================================================
// DynamicPerCpu
// =============================================================================

/// One `T` per CPU, carved out of the dynamic per-CPU region
pub struct DynamicPerCpu<T: Send + Sync> {
    offset: PerCpuOffset,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync> fmt::Debug for DynamicPerCpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicPerCpu")
            .field("offset", &self.offset)
            .field("size", &Self::slot_size())
            .finish()
    }
}

impl<T: Send + Sync> DynamicPerCpu<T> {
    fn slot_size() -> usize {
        size_of::<T>().max(1)
    }

    /// Allocate and initialize one slot per CPU
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is not initialized or the region is exhausted.
    #[track_caller]
    pub fn new(init: impl FnMut(&Cpu) -> T) -> Self {
        match Self::try_new(init) {
            Ok(var) => var,
            Err(err) => panic!("percpu: cannot allocate dynamic per-cpu variable: {}", err),
        }
    }

    /// Allocate and initialize one slot per CPU, reporting failures
    pub fn try_new(mut init: impl FnMut(&Cpu) -> T) -> SchedResult<Self> {
        let registry = cpu::try_registry().ok_or(SchedError::NotInitialized)?;
        let offset = registry
            .percpu_allocator()
            .alloc(Self::slot_size(), align_of::<T>())?;

        for cpu in registry.cpus() {
            // SAFETY: the slot is freshly allocated, sized and aligned for T,
            // and no other handle refers to it yet.
            unsafe { Self::slot(cpu, offset).as_ptr().write(init(cpu)) };
        }

        Ok(Self {
            offset,
            _marker: PhantomData,
        })
    }

    fn slot(cpu: &Cpu, offset: PerCpuOffset) -> NonNull<T> {
        cpu.area().resolve(offset).cast::<T>()
    }

    fn registry() -> &'static CpuRegistry {
        cpu::registry()
    }

    /// Offset of the slots inside each area
    pub fn offset(&self) -> PerCpuOffset {
        self.offset
    }

    /// The slot of `cpu`
    pub fn for_cpu(&self, cpu: &Cpu) -> &T {
        // SAFETY: initialized in try_new and live until drop; T: Sync makes
        // shared access from any CPU sound.
        unsafe { &*Self::slot(cpu, self.offset).as_ptr() }
    }

    /// The slot of the CPU with id `cpu`, if it exists
    pub fn resolve(&self, cpu: usize) -> Option<&T> {
        Self::registry().cpu(cpu).map(|cpu| self.for_cpu(cpu))
    }

    /// The slot of the CPU executing the caller
    ///
    /// Without migration disabled the caller may be moved right after the
    /// lookup; the reference stays valid but may belong to another CPU.
    pub fn get(&self) -> &T {
        self.for_cpu(cpu::current())
    }

    /// All slots, by CPU
    pub fn iter(&self) -> impl Iterator<Item = (&'static Cpu, &T)> + '_ {
        Self::registry()
            .cpus()
            .iter()
            .map(move |cpu| (cpu, self.for_cpu(cpu)))
    }
}

impl<T: Send + Sync> Drop for DynamicPerCpu<T> {
    fn drop(&mut self) {
        let registry = Self::registry();
        for cpu in registry.cpus() {
            // SAFETY: each slot holds a live T that nobody can reach after
            // this handle is gone.
            unsafe { core::ptr::drop_in_place(Self::slot(cpu, self.offset).as_ptr()) };
        }
        registry
            .percpu_allocator()
            .free(self.offset, Self::slot_size());
    }
}

// =============================================================================
// PercpuCounter
// =============================================================================

/// Per-CPU counter
///
/// Updates touch only the updating CPU's word, with preemption disabled so
/// the read-modify-write cannot be split by a switch. Reads add up all
/// words and may miss updates in flight.
///
/// Host threads outside the scheduler own no CPU and so cannot write a
/// per-CPU word; they add atomically to a word of their own.
pub struct PercpuCounter {
    slots: DynamicPerCpu<AtomicU64>,
    unbound: AtomicU64,
}

impl fmt::Debug for PercpuCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PercpuCounter")
            .field("value", &self.read())
            .finish()
    }
}

impl PercpuCounter {
    /// Create a counter at zero
    ///
    /// # Panics
    ///
    /// Panics if the scheduler is not initialized or the per-CPU region is
    /// exhausted.
    #[track_caller]
    pub fn new() -> Self {
        Self {
            slots: DynamicPerCpu::new(|_| AtomicU64::new(0)),
            unbound: AtomicU64::new(0),
        }
    }

    /// Create a counter at zero, reporting failures
    pub fn try_new() -> SchedResult<Self> {
        Ok(Self {
            slots: DynamicPerCpu::try_new(|_| AtomicU64::new(0))?,
            unbound: AtomicU64::new(0),
        })
    }

    /// Add one
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        let me = Thread::current();
        if !me.is_bound() {
            self.unbound.fetch_add(n, Ordering::Relaxed);
            return;
        }

        let _preempt = PreemptGuard::new();
        let slot = self.slots.for_cpu(me.cpu());
        slot.store(slot.load(Ordering::Relaxed).wrapping_add(n), Ordering::Relaxed);
    }

    /// Sum over all CPUs
    pub fn read(&self) -> u64 {
        self.slots
            .iter()
            .map(|(_, slot)| slot.load(Ordering::Relaxed))
            .fold(self.unbound.load(Ordering::Relaxed), u64::wrapping_add)
    }
}

impl Default for PercpuCounter {
    fn default() -> Self {
        Self::new()
    }
}
