//! # unisched Memory Subsystem
//!
//! Dynamic per-CPU storage. Every CPU owns an identical copy of a fixed-size
//! region; an allocation reserves the same offset in all copies at once, so a
//! single [`PerCpuOffset`] names one slot per CPU.
//!
//! [`percpu`] holds the allocator, the per-CPU areas and their error type.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod percpu;

pub use percpu::{
    PerCpuAllocator, PerCpuArea, PerCpuError, PerCpuOffset, PERCPU_AREA_ALIGN,
    PERCPU_DYNAMIC_SIZE,
};
