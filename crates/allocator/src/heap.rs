//! The system heap: default source of buffers for allocators created without
//! a parent.
//!
//! A [`SystemHeap`] is a cheap, cloneable handle. All clones share the same
//! counters, so the embedding application can create one at start-up, pass
//! it to every allocator it builds, and check
//! [`active_allocations`](SystemHeap::active_allocations) at shutdown to find
//! leaked buffers.

use alloc::rc::Rc;
use core::{alloc::Layout, cell::Cell, ptr::NonNull};

use snafu::OptionExt as _;

use crate::{AllocError, Region, error::SystemHeapSnafu};

/// Alignment of every buffer obtained from the system heap.
pub const MIN_BUFFER_ALIGN: usize = 64;

#[derive(Debug, Default)]
struct HeapStats {
    active_allocations: Cell<usize>,
    bytes_outstanding: Cell<usize>,
}

/// Handle to the global allocator with allocation metrics.
///
/// Only buffers acquired through this handle are counted; allocations served
/// from inside a linear, stack, pool or free-list buffer are not.
#[derive(Debug, Clone, Default)]
pub struct SystemHeap {
    stats: Rc<HeapStats>,
}

/// A buffer obtained from a [`SystemHeap`], with everything needed to give
/// it back.
#[derive(Debug)]
pub(crate) struct HeapLease {
    heap: SystemHeap,
    layout: Layout,
}

impl SystemHeap {
    /// Creates a handle with fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers allocated through this heap and not yet released.
    #[must_use]
    pub fn active_allocations(&self) -> usize {
        self.stats.active_allocations.get()
    }

    /// Total size of the buffers counted by
    /// [`active_allocations`](Self::active_allocations).
    #[must_use]
    pub fn bytes_outstanding(&self) -> usize {
        self.stats.bytes_outstanding.get()
    }

    /// Allocates a zeroed buffer of `size` bytes aligned to at least `align`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `align` is not a power of two.
    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<(Region, HeapLease), AllocError> {
        assert!(size > 0, "Buffer size must be greater than zero");
        assert!(align.is_power_of_two(), "Alignment must be a power of two");

        let align = align.max(MIN_BUFFER_ALIGN);
        let layout = Layout::from_size_align(size, align)
            .ok()
            .context(SystemHeapSnafu { size, align })?;
        // SAFETY: `layout` has a non-zero size
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).context(SystemHeapSnafu { size, align })?;

        let stats = &self.stats;
        stats.active_allocations.set(stats.active_allocations.get() + 1);
        stats.bytes_outstanding.set(stats.bytes_outstanding.get() + size);
        tracing::debug!(size, align, addr = ptr.addr().get(), "system heap allocation");

        // SAFETY: freshly allocated, exclusively owned until `release`
        let region = unsafe { Region::new(ptr, size) };
        let lease = HeapLease {
            heap: self.clone(),
            layout,
        };
        Ok((region, lease))
    }
}

impl HeapLease {
    /// Returns `region` to the heap it was allocated from.
    pub(crate) fn release(self, region: Region) {
        assert_eq!(region.len(), self.layout.size());

        let stats = &self.heap.stats;
        stats.active_allocations.set(stats.active_allocations.get() - 1);
        stats.bytes_outstanding.set(stats.bytes_outstanding.get() - region.len());
        tracing::debug!(size = region.len(), addr = region.addr(), "system heap release");

        // SAFETY: `region` was allocated by `allocate` with `self.layout` and is
        // consumed here, so it cannot be released twice.
        unsafe { alloc::alloc::dealloc(region.as_ptr().as_ptr(), self.layout) }
    }
}
