//! Stack (LIFO) allocator.
//!
//! Every block is preceded by a [`BlockHeader`] recording the block's full
//! size and a sequence number. Blocks must be returned in exact reverse
//! order of allocation; the sequence number lets the allocator detect
//! violations and refuse them instead of corrupting its offset.
//!
//! ```text
//! ┌─────────┬────────┬────────┬─────────┬────────┬────────┬──────────┐
//! │ padding │ header │ block1 │ padding │ header │ block2 │   free   │
//! │         │ id = 1 │        │         │ id = 2 │        │          │
//! └─────────┴────────┴────────┴─────────┴────────┴────────┴──────────┘
//!                                                         ▲
//!                                                       offset
//! ```

use core::ptr::NonNull;

use dataview::Pod;
use snafu::{OptionExt as _, ensure};

use crate::{
    AllocError, AllocatorKind, ParentAllocator, Region, SystemHeap,
    align::{child_buffer_align, padding_with_header},
    error::{
        ChildrenOutstandingSnafu, CorruptHeaderSnafu, ForeignPointerSnafu, OrderViolationSnafu,
        OutOfMemorySnafu,
    },
    heap::MIN_BUFFER_ALIGN,
    owner::Backing,
};

const KIND: AllocatorKind = AllocatorKind::Stack;

/// Header written immediately before every payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct BlockHeader {
    /// Bytes consumed by the block: leading padding, header and payload.
    size: usize,
    /// Sequence number of the block, starting at 1.
    id: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A LIFO allocator over a fixed buffer.
///
/// # Invariants
///
/// The live blocks, in address order, carry the ids `1..=current_id`.
#[derive(Debug)]
pub struct StackAllocator {
    backing: Backing,
    capacity: usize,
    offset: usize,
    current_id: usize,
    children: usize,
}

impl StackAllocator {
    /// Creates a stack allocator over a fresh `capacity`-byte buffer from the
    /// system heap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, heap: &SystemHeap) -> Result<Self, AllocError> {
        let backing = Backing::system(KIND, heap, capacity, MIN_BUFFER_ALIGN)?;
        Ok(Self::with_backing(backing, capacity))
    }

    /// Creates a stack allocator whose buffer is carved out of `parent`.
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

    /// Creates a stack allocator managing memory owned by the caller.
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
            current_id: 0,
            children: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> AllocatorKind {
        KIND
    }

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

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sequence number of the most recent live block, `0` when empty.
    #[must_use]
    pub fn current_id(&self) -> usize {
        self.current_id
    }

    /// Pushes a block of `size` bytes directly after the previous one.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn request_memory(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let payload = self.push(size, HEADER_SIZE)?;
        Ok(self.backing.region()?.ptr_at(payload))
    }

    /// Pushes a block of `size` bytes whose address is a multiple of
    /// `alignment`. Padding is inserted in front of the header.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `alignment` is not a power of two.
    pub fn request_aligned_memory(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let payload = self.push_aligned(size, alignment)?;
        Ok(self.backing.region()?.ptr_at(payload))
    }

    /// Pops the block starting at `ptr`.
    ///
    /// Only the most recent live block can be returned. Any other block is
    /// refused with [`AllocError::OrderViolation`] and stays allocated; the
    /// allocator state is not modified.
    pub fn return_memory(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let region = self.backing.region()?;
        let payload = region
            .offset_of(ptr)
            .filter(|&offset| (HEADER_SIZE..=self.offset).contains(&offset))
            .context(ForeignPointerSnafu {
                kind: KIND,
                addr: ptr.addr().get(),
            })?;
        let header_offset = payload - HEADER_SIZE;
        let header = region
            .read::<BlockHeader>(header_offset)
            .context(CorruptHeaderSnafu {
                kind: KIND,
                offset: header_offset,
            })?;

        if header.id != self.current_id {
            tracing::warn!(
                expected = self.current_id,
                found = header.id,
                "stack allocator block returned out of order"
            );
            return OrderViolationSnafu {
                expected: self.current_id,
                found: header.id,
            }
            .fail();
        }
        ensure!(
            (HEADER_SIZE..=self.offset).contains(&header.size),
            CorruptHeaderSnafu {
                kind: KIND,
                offset: header_offset
            }
        );

        tracing::trace!(id = header.id, size = header.size, "stack block returned");
        self.offset -= header.size;
        self.current_id -= 1;
        Ok(())
    }

    /// Pops every block at once.
    pub fn reset_allocator(&mut self) -> Result<(), AllocError> {
        ensure!(
            self.children == 0,
            ChildrenOutstandingSnafu {
                kind: KIND,
                count: self.children
            }
        );
        self.offset = 0;
        self.current_id = 0;
        Ok(())
    }

    /// Gives the buffer back to whoever supplied it and empties the
    /// allocator. Calling it again is a no-op.
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
        self.current_id = 0;
        Ok(())
    }

    fn push_aligned(&mut self, size: usize, alignment: usize) -> Result<usize, AllocError> {
        let base = self.backing.region()?.addr();
        let padding = padding_with_header(base + self.offset, alignment, HEADER_SIZE);
        self.push(size, padding)
    }

    /// Reserves `padding + size` bytes at the current offset, with the header
    /// in the last `HEADER_SIZE` bytes of the padding. Returns the payload
    /// offset.
    fn push(&mut self, size: usize, padding: usize) -> Result<usize, AllocError> {
        assert!(size > 0, "Size must be greater than zero");
        debug_assert!(padding >= HEADER_SIZE);
        self.backing.region()?;

        let start = self.offset;
        let available = self.capacity - self.offset;
        let block_size = padding
            .checked_add(size)
            .filter(|&block_size| block_size <= available)
            .context(OutOfMemorySnafu {
                kind: KIND,
                requested: size,
                available,
            })?;

        let id = self.current_id + 1;
        let payload = start + padding;
        self.backing.region_mut()?.write(
            payload - HEADER_SIZE,
            BlockHeader {
                size: block_size,
                id,
            },
        );
        tracing::trace!(id, offset = payload, size, "stack block pushed");

        self.current_id = id;
        self.offset = start + block_size;
        Ok(payload)
    }

    pub(crate) fn provide_child(&mut self, size: usize, align: usize) -> Result<Region, AllocError> {
        let payload = self.push_aligned(size, align)?;
        let child = self.backing.region()?.split_off(payload, size);
        self.children += 1;
        Ok(child)
    }

    pub(crate) fn reclaim_child(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.return_memory(ptr)?;
        debug_assert!(self.children > 0);
        self.children = self.children.saturating_sub(1);
        Ok(())
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.free_memory() {
            tracing::warn!(%err, "stack allocator dropped without releasing its buffer");
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn with_test_allocator<F>(capacity: usize, test_fn: F)
    where
        F: FnOnce(&mut StackAllocator),
    {
        let heap = SystemHeap::new();
        let mut allocator = StackAllocator::new(capacity, &heap).unwrap();
        test_fn(&mut allocator);
        allocator.free_memory().unwrap();
        assert_eq!(heap.active_allocations(), 0);
    }

    #[test]
    fn test_lifo_order() {
        with_test_allocator(1024, |allocator| {
            let a = allocator.request_memory(32).unwrap();
            let after_a = allocator.offset();
            let b = allocator.request_memory(48).unwrap();
            let after_b = allocator.offset();
            let c = allocator.request_memory(16).unwrap();
            assert_eq!(allocator.current_id(), 3);
            assert_eq!(allocator.offset(), 3 * HEADER_SIZE + 32 + 48 + 16);

            allocator.return_memory(c).unwrap();
            assert_eq!(allocator.offset(), after_b);
            allocator.return_memory(b).unwrap();
            assert_eq!(allocator.offset(), after_a);
            allocator.return_memory(a).unwrap();
            assert_eq!(allocator.offset(), 0);
            assert_eq!(allocator.current_id(), 0);
        });
    }

    #[test]
    fn test_out_of_order_return_is_refused() {
        with_test_allocator(1024, |allocator| {
            let a = allocator.request_memory(32).unwrap();
            let b = allocator.request_memory(32).unwrap();
            let c = allocator.request_memory(32).unwrap();
            let offset = allocator.offset();

            let err = allocator.return_memory(b).unwrap_err();
            assert!(matches!(
                err,
                AllocError::OrderViolation {
                    expected: 3,
                    found: 2,
                    ..
                }
            ));
            assert_eq!(allocator.offset(), offset);
            assert_eq!(allocator.current_id(), 3);

            allocator.return_memory(c).unwrap();
            allocator.return_memory(b).unwrap();
            allocator.return_memory(a).unwrap();
            assert_eq!(allocator.offset(), 0);
        });
    }

    #[test]
    fn test_payload_survives_header_writes() {
        with_test_allocator(256, |allocator| {
            let a = allocator.request_memory(16).unwrap();
            unsafe { a.write_bytes(0x33, 16) };
            let b = allocator.request_memory(16).unwrap();
            unsafe { b.write_bytes(0x44, 16) };
            for i in 0..16 {
                assert_eq!(unsafe { a.add(i).read() }, 0x33);
            }
            allocator.return_memory(b).unwrap();
            allocator.return_memory(a).unwrap();
        });
    }

    #[test]
    fn test_aligned_allocations() {
        with_test_allocator(4096, |allocator| {
            let mut blocks = Vec::new();
            for align in [1, 2, 4, 8, 16, 32, 64] {
                blocks.push(allocator.request_memory(5).unwrap());
                let ptr = allocator.request_aligned_memory(24, align).unwrap();
                assert_eq!(ptr.addr().get() % align, 0);
                blocks.push(ptr);
            }
            assert_eq!(allocator.current_id(), 14);

            for ptr in blocks.into_iter().rev() {
                allocator.return_memory(ptr).unwrap();
            }
            assert_eq!(allocator.offset(), 0);
            assert_eq!(allocator.current_id(), 0);
        });
    }

    #[test]
    fn test_exhaustion() {
        with_test_allocator(64, |allocator| {
            allocator.request_memory(64 - HEADER_SIZE).unwrap();
            let err = allocator.request_memory(1).unwrap_err();
            assert!(matches!(err, AllocError::OutOfMemory { available: 0, .. }));
            assert_eq!(allocator.current_id(), 1);
        });
    }

    #[test]
    fn test_foreign_pointer() {
        with_test_allocator(128, |allocator| {
            let a = allocator.request_memory(16).unwrap();
            let past_top = unsafe { a.add(64) };
            assert!(matches!(
                allocator.return_memory(past_top),
                Err(AllocError::ForeignPointer { .. })
            ));
            let mut other = [0u8; 32];
            let outside = NonNull::new(other.as_mut_ptr()).unwrap();
            assert!(allocator.return_memory(outside).is_err());
            allocator.return_memory(a).unwrap();
        });
    }

    #[test]
    fn test_reset() {
        with_test_allocator(128, |allocator| {
            let first = allocator.request_memory(8).unwrap();
            allocator.request_memory(8).unwrap();
            allocator.reset_allocator().unwrap();
            assert_eq!(allocator.current_id(), 0);
            assert_eq!(allocator.request_memory(8).unwrap(), first);
            assert_eq!(allocator.current_id(), 1);
        });
    }
}
