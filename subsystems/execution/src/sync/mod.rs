//! # Synchronization Primitives
//!
//! - [`SpinLock`]: a spinning mutex that disables preemption while held
//! - [`Semaphore`]: a counting semaphore with FIFO waiters and timeouts

pub mod semaphore;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
