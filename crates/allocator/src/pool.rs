//! Fixed-size pool allocator.
//!
//! The buffer is sliced into `item_count` chunks of `chunk_size` bytes each.
//! Free chunks form an intrusive singly-linked list: the first bytes of every
//! free chunk hold the offset of the next free chunk. Allocation pops the
//! head of the list and deallocation pushes onto it, so both are O(1) and a
//! freshly returned chunk is the next one handed out.
//!
//! ```text
//!  head
//!   │
//!   ▼
//! ┌──────┬──────┬──────┬──────┐
//! │ next ├─────►│ next ├─────►│ null │    chunk 1 checked out
//! └──────┴──────┴──────┴──────┘
//!  chunk 0  chunk 1  chunk 2  chunk 3
//! ```
//!
//! Returning a chunk twice is a caller bug. The allocator notices it when the
//! free count would exceed the item count, and debug builds also search the
//! free list on every return.

use core::ptr::NonNull;

use dataview::Pod;
use snafu::{OptionExt as _, ensure};

use crate::{
    AllocError, AllocatorKind, ParentAllocator, Region, SystemHeap,
    align::{align_forward, child_buffer_align, is_aligned},
    error::{
        ChildrenOutstandingSnafu, ChunkTooSmallSnafu, CorruptHeaderSnafu, DoubleFreeSnafu,
        ForeignPointerSnafu, MisalignedBufferSnafu, PoolExhaustedSnafu,
    },
    owner::Backing,
};

const KIND: AllocatorKind = AllocatorKind::Pool;

/// Free-list link stored in the first bytes of a free chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct FreeChunk {
    /// Offset of the next free chunk, or [`END_OF_LIST`].
    next: usize,
}

const END_OF_LIST: usize = usize::MAX;

/// Size of the smallest chunk a pool can manage.
pub const MIN_CHUNK_SIZE: usize = size_of::<FreeChunk>();

/// An allocator of equally sized, equally aligned chunks.
///
/// # Invariants
///
/// `free_item_count` equals the number of chunks reachable from the list
/// head. Every chunk is either on the list or checked out.
#[derive(Debug)]
pub struct PoolAllocator {
    backing: Backing,
    item_count: usize,
    item_size: usize,
    alignment: usize,
    chunk_size: usize,
    head: Option<usize>,
    free_item_count: usize,
    children: usize,
}

/// Returns `(chunk_size, buffer_size)` for a pool.
fn pool_layout(item_count: usize, item_size: usize, alignment: usize) -> (usize, usize) {
    assert!(item_count > 0, "Item count must be greater than zero");
    assert!(item_size > 0, "Item size must be greater than zero");
    let chunk_size = align_forward(item_size, alignment);
    assert!(
        chunk_size >= MIN_CHUNK_SIZE,
        "Chunk size must be at least {MIN_CHUNK_SIZE} bytes to hold a free-list node"
    );
    let Some(buffer_size) = chunk_size.checked_mul(item_count) else {
        panic!("Pool of {item_count} chunks of {chunk_size} bytes overflows usize");
    };
    (chunk_size, buffer_size)
}

impl PoolAllocator {
    /// Creates a pool of `item_count` chunks over a fresh buffer from the
    /// system heap.
    ///
    /// # Panics
    ///
    /// Panics if `item_count` or `item_size` is zero, if `alignment` is not a
    /// power of two, or if the aligned item size is smaller than
    /// [`MIN_CHUNK_SIZE`].
    pub fn new(
        item_count: usize,
        item_size: usize,
        alignment: usize,
        heap: &SystemHeap,
    ) -> Result<Self, AllocError> {
        let (_, buffer_size) = pool_layout(item_count, item_size, alignment);
        let backing = Backing::system(KIND, heap, buffer_size, alignment)?;
        Ok(Self::with_backing(backing, item_count, item_size, alignment))
    }

    /// Creates a pool whose buffer is carved out of `parent`.
    ///
    /// If the parent supplies a buffer that is not aligned to `alignment`
    /// (pool parents hand out chunks at their own alignment), the buffer is
    /// given back and [`AllocError::MisalignedBuffer`] is returned.
    ///
    /// # Panics
    ///
    /// Same conditions as [`new`](Self::new).
    pub fn with_parent(
        item_count: usize,
        item_size: usize,
        alignment: usize,
        parent: impl Into<ParentAllocator>,
    ) -> Result<Self, AllocError> {
        let (_, buffer_size) = pool_layout(item_count, item_size, alignment);
        let align = child_buffer_align(buffer_size).max(alignment);
        let mut backing = Backing::from_parent(KIND, parent.into(), buffer_size, align)?;

        let addr = backing.region()?.addr();
        if !is_aligned(addr, alignment) {
            backing.release()?;
            return MisalignedBufferSnafu {
                addr,
                align: alignment,
            }
            .fail();
        }
        Ok(Self::with_backing(backing, item_count, item_size, alignment))
    }

    /// Creates a pool managing `len` bytes of memory owned by the caller.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr..ptr + len` is valid for reads and writes
    /// - the memory is not used by anything else while the allocator owns it
    /// - the memory outlives the allocator
    ///
    /// # Panics
    ///
    /// Same conditions as [`new`](Self::new). Also panics if `ptr` is not
    /// aligned to `alignment` or `len` cannot hold `item_count` chunks.
    pub unsafe fn from_external(
        ptr: NonNull<u8>,
        len: usize,
        item_count: usize,
        item_size: usize,
        alignment: usize,
    ) -> Self {
        let (_, buffer_size) = pool_layout(item_count, item_size, alignment);
        assert!(
            len >= buffer_size,
            "External buffer of {len} bytes cannot hold {buffer_size} bytes of chunks"
        );
        assert!(
            is_aligned(ptr.addr().get(), alignment),
            "External buffer must be aligned to {alignment} bytes"
        );
        // SAFETY: forwarded to the caller
        let backing = unsafe { Backing::external(KIND, ptr, len) };
        Self::with_backing(backing, item_count, item_size, alignment)
    }

    fn with_backing(
        mut backing: Backing,
        item_count: usize,
        item_size: usize,
        alignment: usize,
    ) -> Self {
        let (chunk_size, _) = pool_layout(item_count, item_size, alignment);
        if let Ok(region) = backing.region_mut() {
            for index in 0..item_count {
                let next = if index + 1 < item_count {
                    (index + 1) * chunk_size
                } else {
                    END_OF_LIST
                };
                region.write(index * chunk_size, FreeChunk { next });
            }
        }
        Self {
            backing,
            item_count,
            item_size,
            alignment,
            chunk_size,
            head: Some(0),
            free_item_count: item_count,
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
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Item size rounded up to the alignment: the stride between chunks.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn free_item_count(&self) -> usize {
        self.free_item_count
    }

    /// Checks out one chunk.
    ///
    /// Fails with [`AllocError::PoolExhausted`] when every chunk is in use.
    pub fn request_memory(&mut self) -> Result<NonNull<u8>, AllocError> {
        let offset = self.pop()?;
        Ok(self.backing.region()?.ptr_at(offset))
    }

    /// Puts a chunk back on the free list.
    ///
    /// `ptr` must be a chunk previously obtained from this pool and not
    /// returned since. Pointers that are not chunk starts of this pool are
    /// rejected with [`AllocError::ForeignPointer`]; returning a chunk twice
    /// is rejected with [`AllocError::DoubleFree`] whenever it can be
    /// detected.
    pub fn return_memory(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let region = self.backing.region()?;
        let offset = region
            .offset_of(ptr)
            .filter(|&offset| self.is_chunk(offset))
            .context(ForeignPointerSnafu {
                kind: KIND,
                addr: ptr.addr().get(),
            })?;

        ensure!(
            self.free_item_count < self.item_count,
            DoubleFreeSnafu { kind: KIND, offset }
        );
        #[cfg(debug_assertions)]
        if self.free_chunks(region).any(|free| free == offset) {
            tracing::warn!(offset, "pool chunk returned twice");
            return DoubleFreeSnafu { kind: KIND, offset }.fail();
        }

        let next = self.head.unwrap_or(END_OF_LIST);
        self.backing
            .region_mut()?
            .write(offset, FreeChunk { next });
        self.head = Some(offset);
        self.free_item_count += 1;
        tracing::trace!(offset, free = self.free_item_count, "pool chunk returned");
        Ok(())
    }

    /// Gives the buffer back to whoever supplied it and empties the pool.
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
        self.item_count = 0;
        self.item_size = 0;
        self.chunk_size = 0;
        self.head = None;
        self.free_item_count = 0;
        Ok(())
    }

    fn is_chunk(&self, offset: usize) -> bool {
        offset < self.chunk_size * self.item_count && offset % self.chunk_size == 0
    }

    /// Offsets of the free chunks, in list order.
    #[cfg(any(test, debug_assertions))]
    fn free_chunks<'a>(&self, region: &'a Region) -> impl Iterator<Item = usize> + 'a {
        core::iter::successors(self.head, move |&offset| {
            region
                .read::<FreeChunk>(offset)
                .map(|chunk| chunk.next)
                .filter(|&next| next != END_OF_LIST)
        })
        .take(self.free_item_count)
    }

    fn pop(&mut self) -> Result<usize, AllocError> {
        let region = self.backing.region()?;
        let offset = self
            .head
            .filter(|_| self.free_item_count > 0)
            .context(PoolExhaustedSnafu {
                item_count: self.item_count,
            })?;
        let next = region
            .read::<FreeChunk>(offset)
            .map(|chunk| chunk.next)
            .filter(|&next| next == END_OF_LIST || self.is_chunk(next))
            .context(CorruptHeaderSnafu { kind: KIND, offset })?;

        self.head = (next != END_OF_LIST).then_some(next);
        self.free_item_count -= 1;
        tracing::trace!(offset, free = self.free_item_count, "pool chunk checked out");
        Ok(offset)
    }

    pub(crate) fn provide_child(&mut self, size: usize) -> Result<Region, AllocError> {
        ensure!(
            size <= self.chunk_size,
            ChunkTooSmallSnafu {
                requested: size,
                chunk_size: self.chunk_size
            }
        );
        let offset = self.pop()?;
        let child = self.backing.region()?.split_off(offset, size);
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

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.free_memory() {
            tracing::warn!(%err, "pool allocator dropped without releasing its buffer");
        }
    }
}
