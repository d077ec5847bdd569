//! Linear (arena) allocator.
//!
//! A linear allocator hands out memory by bumping an offset through its
//! buffer. Individual allocations are never freed; the whole buffer is
//! recycled at once with [`reset_allocator`](LinearAllocator::reset_allocator).
//!
//! ```text
//! ┌─────┬───┬────────┬─────────────────────────────┐
//! │ A1  │pad│   A2   │          free               │
//! └─────┴───┴────────┴─────────────────────────────┘
//!                    ▲                             ▲
//!                  offset                       capacity
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::{LinearAllocator, SystemHeap};
//!
//! let heap = SystemHeap::new();
//! let mut arena = LinearAllocator::new(1024, &heap).unwrap();
//!
//! let a = arena.request_memory(100).unwrap();
//! let b = arena.request_aligned_memory(64, 32).unwrap();
//! assert_eq!(b.addr().get() % 32, 0);
//! assert!(a < b);
//!
//! arena.reset_allocator().unwrap();
//! assert_eq!(arena.request_memory(100).unwrap(), a);
//!
//! arena.free_memory().unwrap();
//! assert_eq!(heap.active_allocations(), 0);
//! ```

use core::ptr::NonNull;

use snafu::{OptionExt as _, ensure};

use crate::{
    AllocError, AllocatorKind, ParentAllocator, Region, SystemHeap,
    align::{align_forward, child_buffer_align},
    error::{ChildrenOutstandingSnafu, OutOfMemorySnafu},
    heap::MIN_BUFFER_ALIGN,
    owner::Backing,
};

const KIND: AllocatorKind = AllocatorKind::Linear;

/// A bump allocator over a fixed buffer.
///
/// # Invariants
///
/// `0 <= offset <= capacity` at all times. The offset only grows, except on
/// [`reset_allocator`](Self::reset_allocator) and
/// [`free_memory`](Self::free_memory).
#[derive(Debug)]
pub struct LinearAllocator {
    backing: Backing,
    capacity: usize,
    offset: usize,
    children: usize,
}

impl LinearAllocator {
    /// Creates a linear allocator over a fresh `capacity`-byte buffer from the
    /// system heap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, heap: &SystemHeap) -> Result<Self, AllocError> {
        let backing = Backing::system(KIND, heap, capacity, MIN_BUFFER_ALIGN)?;
        Ok(Self::with_backing(backing, capacity))
    }

    /// Creates a linear allocator whose buffer is carved out of `parent`.
    ///
    /// The buffer goes back to `parent` when this allocator is freed.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_parent(
        capacity: usize,
        parent: impl Into<ParentAllocator>,
    ) -> Result<Self, AllocError> {
        let backing =
            Backing::from_parent(KIND, parent.into(), capacity, child_buffer_align(capacity))?;
        Ok(Self::with_backing(backing, capacity))
    }

    /// Creates a linear allocator managing memory owned by the caller.
    ///
    /// [`free_memory`](Self::free_memory) leaves the buffer untouched.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr..ptr + capacity` is valid for reads and writes
    /// - the memory is not used by anything else while the allocator owns it
    /// - the memory outlives the allocator
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub unsafe fn from_external(ptr: NonNull<u8>, capacity: usize) -> Self {
        // SAFETY: forwarded to the caller
        let backing = unsafe { Backing::external(KIND, ptr, capacity) };
        Self::with_backing(backing, capacity)
    }

    fn with_backing(backing: Backing, capacity: usize) -> Self {
        Self {
            backing,
            capacity,
            offset: 0,
            children: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> AllocatorKind {
        KIND
    }

    /// Kind of the entity that supplied the buffer, or `None` once the buffer
    /// has been released.
    #[must_use]
    pub fn parent_kind(&self) -> Option<AllocatorKind> {
        self.backing.parent_kind()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.backing.is_released()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes consumed so far, alignment padding included.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    /// Start of the managed buffer, or `None` once it has been released.
    #[must_use]
    pub fn base_ptr(&self) -> Option<NonNull<u8>> {
        self.backing.region().ok().map(Region::as_ptr)
    }

    /// Reserves `size` bytes at the current offset, without alignment.
    ///
    /// Fails with [`AllocError::OutOfMemory`] if fewer than `size` bytes
    /// remain; the offset is left unchanged in that case.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn request_memory(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        assert!(size > 0, "Size must be greater than zero");
        let start = self.offset;
        self.bump(start, size)?;
        Ok(self.backing.region()?.ptr_at(start))
    }

    /// Reserves `size` zeroed bytes whose address is a multiple of
    /// `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `alignment` is not a power of two.
    pub fn request_aligned_memory(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let start = self.carve(size, alignment)?;
        let region = self.backing.region_mut()?;
        region.fill(start, size, 0);
        Ok(region.ptr_at(start))
    }

    /// Rewinds the offset to the start of the buffer.
    ///
    /// Every pointer handed out before the reset becomes invalid; using one
    /// afterwards is a bug in the caller. Buffers lent to child allocators
    /// cannot be invalidated this way, so the reset is refused while any are
    /// outstanding.
    pub fn reset_allocator(&mut self) -> Result<(), AllocError> {
        ensure!(
            self.children == 0,
            ChildrenOutstandingSnafu {
                kind: KIND,
                count: self.children
            }
        );
        self.offset = 0;
        Ok(())
    }

    /// Gives the buffer back to whoever supplied it and empties the
    /// allocator.
    ///
    /// Calling it again is a no-op.
    pub fn free_memory(&mut self) -> Result<(), AllocError> {
        ensure!(
            self.children == 0,
            ChildrenOutstandingSnafu {
                kind: KIND,
                count: self.children
            }
        );
        self.backing.release()?;
        self.capacity = 0;
        self.offset = 0;
        Ok(())
    }

    /// Finds room for `size` bytes aligned to `alignment` and advances the
    /// offset past them. Returns the offset of the reserved bytes.
    fn carve(&mut self, size: usize, alignment: usize) -> Result<usize, AllocError> {
        assert!(size > 0, "Size must be greater than zero");
        let base = self.backing.region()?.addr();
        let start = align_forward(base + self.offset, alignment) - base;
        self.bump(start, size)?;
        Ok(start)
    }

    fn bump(&mut self, start: usize, size: usize) -> Result<(), AllocError> {
        self.backing.region()?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .context(OutOfMemorySnafu {
                kind: KIND,
                requested: size,
                available: self.remaining(),
            })?;
        tracing::trace!(offset = start, size, "linear allocation");
        self.offset = end;
        Ok(())
    }

    pub(crate) fn provide_child(&mut self, size: usize, align: usize) -> Result<Region, AllocError> {
        let start = self.carve(size, align)?;
        let child = self.backing.region()?.split_off(start, size);
        self.children += 1;
        Ok(child)
    }

    /// Linear allocators cannot take memory back; a returned child buffer
    /// stays consumed until the next reset.
    pub(crate) fn reclaim_child(&mut self) {
        debug_assert!(self.children > 0);
        self.children = self.children.saturating_sub(1);
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.free_memory() {
            tracing::warn!(%err, "linear allocator dropped without releasing its buffer");
        }
    }
}
