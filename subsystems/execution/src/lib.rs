//! # unisched Execution Subsystem
//!
//! Thread scheduler and synchronization core.
//!
//! ## Layering
//!
//! ```text
//! workers ─┐
//! percpu ──┼─> semaphore ─> wait/wake ─> sched ─> preempt ─> thread ─> cpu
//! timer ───┘
//! ```
//!
//! - [`cpu`]: the CPU registry, per-CPU run queues and online notifiers
//! - [`thread`]: thread objects, attributes, lifecycle and the thread registry
//! - [`preempt`]: preemption and migration gates
//! - [`wait`]: the wait/wake protocol
//! - [`timer`]: one-shot thread timers driven by the clock-event device
//! - [`sync`]: [`SpinLock`](sync::SpinLock) and [`Semaphore`](sync::Semaphore)
//! - [`percpu`]: dynamic per-CPU variables and per-CPU counters
//! - [`workers`]: per-CPU worker dispatch
//!
//! ## Boot
//!
//! ```ignore
//! unisched_execution::init(SchedConfig::default())?;
//! let t = Thread::spawn(|| log::info!("hello from {}", cpu::current_id()))?;
//! t.join();
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod error;
pub mod percpu;
pub mod preempt;
pub mod sched;
pub mod stats;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod wait;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

use alloc::sync::Arc;

use unisched_hal::clockevent;

pub use config::SchedConfig;
pub use cpu::{Cpu, CpuFlags};
pub use error::{SchedError, SchedResult};
pub use percpu::{DynamicPerCpu, PercpuCounter};
pub use preempt::{
    migrate_disable, migrate_enable, preempt_count, preempt_disable, preempt_enable,
    preempt_point, preemptable, MigrationGuard, PreemptGuard,
};
pub use sync::{Semaphore, SpinLock, SpinLockGuard};
pub use thread::{Attr, Status, Thread, ThreadId, PRIORITY_DEFAULT};
pub use timer::Timer;
pub use wait::{wait_until, wait_until_interruptible, wait_until_unlocked, Interrupted};
pub use workers::WorkerItem;

/// Bring the scheduler up
///
/// Creates every CPU, hooks the clock-event device and brings the CPUs
/// online, running the registered CPU notifiers. The calling host thread
/// keeps running as an unbound context on the boot CPU.
pub fn init(config: SchedConfig) -> SchedResult<()> {
    config.validate()?;
    unisched_hal::clock::init();

    let registry = cpu::install(config)?;
    workers::init();

    let device = clockevent::clock_event();
    device.set_callback(Arc::new(timer::ClockDispatch));
    device.set_periodic(Some(registry.config().tick));
    device.start()?;

    for cpu in registry.cpus() {
        cpu::bring_up(cpu);
    }

    log::info!(
        "sched: {} cpus online, tick {:?}, load balancing {}",
        registry.count(),
        registry.config().tick,
        if registry.config().load_balance { "on" } else { "off" }
    );
    Ok(())
}

/// Whether [`init`] has completed its first phase
pub fn is_initialized() -> bool {
    cpu::try_registry().is_some()
}
