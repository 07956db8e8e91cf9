//! # Dynamic Per-CPU Storage
//!
//! [`PerCpuAllocator`] hands out byte ranges of the dynamic per-CPU region.
//! Each CPU owns a [`PerCpuArea`], one copy of that region; a
//! [`PerCpuOffset`] is valid in all of them.
//!
//! Occupancy is tracked with one bit per byte under a single lock.

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use core::fmt;
use core::ptr::NonNull;

use bitvec::prelude::BitVec;
use spin::Mutex;

// =============================================================================
// Constants
// =============================================================================

/// Size of the dynamic per-CPU region, in bytes
pub const PERCPU_DYNAMIC_SIZE: usize = 65536;

/// Alignment of every per-CPU area
pub const PERCPU_AREA_ALIGN: usize = 4096;

static_assertions::const_assert!(PERCPU_AREA_ALIGN.is_power_of_two());
static_assertions::const_assert_eq!(PERCPU_DYNAMIC_SIZE % PERCPU_AREA_ALIGN, 0);

// =============================================================================
// Errors
// =============================================================================

/// Per-CPU allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerCpuError {
    /// Alignment is not a power of two, or exceeds the area alignment
    InvalidAlignment(usize),
    /// Zero-sized request
    InvalidSize(usize),
    /// No aligned free range is large enough
    Exhausted {
        /// Requested size
        size: usize,
        /// Requested alignment
        align: usize,
    },
}

impl fmt::Display for PerCpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAlignment(align) => write!(f, "invalid per-cpu alignment {}", align),
            Self::InvalidSize(size) => write!(f, "invalid per-cpu size {}", size),
            Self::Exhausted { size, align } => write!(
                f,
                "dynamic per-cpu region exhausted ({} bytes, align {})",
                size, align
            ),
        }
    }
}

// =============================================================================
// Offsets
// =============================================================================

/// Offset of an allocation inside every CPU's dynamic area
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PerCpuOffset(usize);

impl PerCpuOffset {
    /// Byte offset from the start of the area
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Allocator for the dynamic per-CPU region
#[derive(Debug)]
pub struct PerCpuAllocator {
    /// One bit per byte of the region, set while allocated
    map: Mutex<BitVec>,
}

impl Default for PerCpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PerCpuAllocator {
    /// Allocator over a region of [`PERCPU_DYNAMIC_SIZE`] bytes
    pub fn new() -> Self {
        Self::with_capacity(PERCPU_DYNAMIC_SIZE)
    }

    /// Allocator over a region of `size` bytes
    pub fn with_capacity(size: usize) -> Self {
        Self {
            map: Mutex::new(BitVec::repeat(false, size)),
        }
    }

    /// Region size in bytes
    pub fn capacity(&self) -> usize {
        self.map.lock().len()
    }

    /// Bytes currently allocated
    pub fn allocated(&self) -> usize {
        self.map.lock().count_ones()
    }

    /// Reserve `size` bytes aligned to `align`
    ///
    /// First fit: the lowest aligned offset whose whole range is free.
    pub fn alloc(&self, size: usize, align: usize) -> Result<PerCpuOffset, PerCpuError> {
        if !align.is_power_of_two() || align > PERCPU_AREA_ALIGN {
            return Err(PerCpuError::InvalidAlignment(align));
        }
        if size == 0 {
            return Err(PerCpuError::InvalidSize(size));
        }

        let mut map = self.map.lock();
        let offset =
            find_free(&map, size, align).ok_or(PerCpuError::Exhausted { size, align })?;
        map[offset..offset + size].fill(true);
        drop(map);

        log::trace!("percpu: alloc {} bytes align {} at {:#x}", size, align, offset);
        Ok(PerCpuOffset(offset))
    }

    /// Release `size` bytes at `offset`
    ///
    /// # Panics
    ///
    /// Panics if any byte of the range is not currently allocated.
    #[track_caller]
    pub fn free(&self, offset: PerCpuOffset, size: usize) {
        let start = offset.as_usize();
        let mut map = self.map.lock();
        let in_bounds = start <= map.len() && size <= map.len() - start;
        if !in_bounds || !map[start..start + size].all() {
            drop(map);
            panic!(
                "percpu: freeing unallocated range {:#x}+{} bytes",
                start, size
            );
        }
        map[start..start + size].fill(false);
    }
}

/// Lowest `align`-aligned offset starting `size` clear bits
fn find_free(map: &BitVec, size: usize, align: usize) -> Option<usize> {
    let mut start = 0;
    while start + size <= map.len() {
        match map[start..start + size].first_one() {
            None => return Some(start),
            // Nothing overlapping the set bit can fit; skip past it.
            Some(used) => start = (start + used + 1).next_multiple_of(align),
        }
    }
    None
}

// =============================================================================
// Per-CPU areas
// =============================================================================

/// One CPU's copy of the dynamic per-CPU region
///
/// Zero-filled on creation.
#[derive(Debug)]
pub struct PerCpuArea {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the area is plain memory. Typed access to its slots is synchronized
// by the per-CPU layers built on top of it.
unsafe impl Send for PerCpuArea {}
unsafe impl Sync for PerCpuArea {}

impl PerCpuArea {
    /// Allocate a zeroed area of `size` bytes
    pub fn new(size: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(1), PERCPU_AREA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("percpu: bad area size {}", size),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
        Self { base, layout }
    }

    /// Area size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Start of the area
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of `offset` inside this area
    #[inline]
    pub fn resolve(&self, offset: PerCpuOffset) -> NonNull<u8> {
        assert!(
            offset.as_usize() < self.size(),
            "percpu: offset {:#x} outside area",
            offset.as_usize()
        );
        // SAFETY: offset is within the allocation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset.as_usize())) }
    }
}

impl Drop for PerCpuArea {
    fn drop(&mut self) {
        // SAFETY: base was allocated with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}
