//! General-purpose free-list allocator.
//!
//! Free space is tracked by an intrusive, address-ordered singly-linked list.
//! Each free block starts with a [`FreeNode`] holding its size and the offset
//! of the next free block. Allocation searches the list for a block that
//! can hold the request plus its alignment padding and header, splits off
//! the unused tail as a new free block, and writes an [`AllocHeader`] right
//! before the payload. Returning a block rebuilds its node from the header,
//! links it back in address order and merges it with any free neighbour it
//! touches.
//!
//! ```text
//!   block start            payload
//!   │                      │
//!   ▼                      ▼
//! ──┬─────────┬────────────┬──────────────────┬──────────────
//!   │ padding │ AllocHeader│     payload      │ next free block
//! ──┴─────────┴────────────┴──────────────────┴──────────────
//!   ◄───────────────── block_size ───────────►
//! ```
//!
//! Every offset stored in managed memory is relative to the start of the
//! buffer.

use core::{iter, ops::Range, ptr::NonNull};

use dataview::Pod;
use derive_more::Display;
use snafu::{OptionExt as _, ensure};

use crate::{
    AllocError, AllocatorKind, ParentAllocator, Region, SystemHeap,
    align::{child_buffer_align, padding_with_header},
    error::{
        ChildrenOutstandingSnafu, CorruptHeaderSnafu, DoubleFreeSnafu, ForeignPointerSnafu,
        OutOfMemorySnafu,
    },
    heap::MIN_BUFFER_ALIGN,
    owner::Backing,
};

const KIND: AllocatorKind = AllocatorKind::GeneralFreelist;

/// Node stored at the start of every free block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct FreeNode {
    /// Offset of the next free block, or [`END_OF_LIST`].
    next: usize,
    /// Size of this free block, node included.
    size: usize,
}

/// Header stored immediately before every payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct AllocHeader {
    /// Bytes consumed by the block, from its start to the end of the payload
    /// (or further, when a leftover too small to be a free block was
    /// absorbed).
    block_size: usize,
    /// Alignment padding between the block start and this header.
    padding: usize,
}

const END_OF_LIST: usize = usize::MAX;
const NODE_SIZE: usize = size_of::<FreeNode>();
const HEADER_SIZE: usize = size_of::<AllocHeader>();

/// Alignment applied to requests that ask for less.
pub const MIN_ALIGNMENT: usize = 8;

/// How the allocator picks a free block for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum PlacementPolicy {
    /// Take the first block, in address order, that fits.
    #[default]
    #[display("find-first")]
    FindFirst,
    /// Take the block that leaves the least space unused. Ties go to the
    /// lowest address.
    #[display("find-best")]
    FindBest,
}

/// A free block chosen for an allocation.
#[derive(Debug)]
struct Fit {
    prev: Option<usize>,
    offset: usize,
    node: FreeNode,
    padding: usize,
}

/// A variable-size allocator with splitting and coalescing.
///
/// # Invariants
///
/// Free blocks are disjoint, linked in increasing address order, and no two
/// of them are adjacent once a return has completed. `used` is the sum of
/// the sizes of all live blocks, so `used + free == capacity`.
#[derive(Debug)]
pub struct FreelistAllocator {
    backing: Backing,
    capacity: usize,
    used: usize,
    head: Option<usize>,
    policy: PlacementPolicy,
    children: usize,
}

/// Follows a node's link, rejecting links that do not move forward.
fn next_link(region: &Region, offset: usize, node: &FreeNode) -> Result<Option<usize>, AllocError> {
    if node.next == END_OF_LIST {
        return Ok(None);
    }
    ensure!(
        node.next > offset && node.next < region.len(),
        CorruptHeaderSnafu { kind: KIND, offset }
    );
    Ok(Some(node.next))
}

fn read_node(region: &Region, offset: usize) -> Result<FreeNode, AllocError> {
    region
        .read::<FreeNode>(offset)
        .filter(|node| region.contains(offset, node.size))
        .context(CorruptHeaderSnafu { kind: KIND, offset })
}

fn set_next(region: &mut Region, offset: usize, next: usize) -> Result<(), AllocError> {
    let node = read_node(region, offset)?;
    region.write(offset, FreeNode { next, ..node });
    Ok(())
}

impl FreelistAllocator {
    /// Creates a free-list allocator over a fresh `capacity`-byte buffer from
    /// the system heap.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold a single free-list node.
    pub fn new(
        capacity: usize,
        policy: PlacementPolicy,
        heap: &SystemHeap,
    ) -> Result<Self, AllocError> {
        assert_capacity(capacity);
        let backing = Backing::system(KIND, heap, capacity, MIN_BUFFER_ALIGN)?;
        Ok(Self::with_backing(backing, capacity, policy))
    }

    /// Creates a free-list allocator whose buffer is carved out of `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold a single free-list node.
    pub fn with_parent(
        capacity: usize,
        policy: PlacementPolicy,
        parent: impl Into<ParentAllocator>,
    ) -> Result<Self, AllocError> {
        assert_capacity(capacity);
        let backing =
            Backing::from_parent(KIND, parent.into(), capacity, child_buffer_align(capacity))?;
        Ok(Self::with_backing(backing, capacity, policy))
    }

    /// Creates a free-list allocator managing memory owned by the caller.
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
    /// Panics if `capacity` cannot hold a single free-list node.
    pub unsafe fn from_external(ptr: NonNull<u8>, capacity: usize, policy: PlacementPolicy) -> Self {
        assert_capacity(capacity);
        // SAFETY: forwarded to the caller
        let backing = unsafe { Backing::external(KIND, ptr, capacity) };
        Self::with_backing(backing, capacity, policy)
    }

    fn with_backing(mut backing: Backing, capacity: usize, policy: PlacementPolicy) -> Self {
        if let Ok(region) = backing.region_mut() {
            region.write(
                0,
                FreeNode {
                    next: END_OF_LIST,
                    size: capacity,
                },
            );
        }
        Self {
            backing,
            capacity,
            used: 0,
            head: Some(0),
            policy,
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

    /// Bytes held by live blocks, padding and headers included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Free blocks in address order, as offsets from the buffer start.
    ///
    /// Yields nothing once the buffer has been released.
    pub fn free_blocks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let region = self.backing.region().ok();
        let mut cursor = region.and(self.head);
        iter::from_fn(move || {
            let region = region?;
            let offset = cursor?;
            let node = region.read::<FreeNode>(offset)?;
            cursor = next_link(region, offset, &node).ok().flatten();
            Some(offset..offset + node.size)
        })
    }

    /// Allocates `size` bytes aligned to [`MIN_ALIGNMENT`].
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn request_memory(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.request_aligned_memory(size, MIN_ALIGNMENT)
    }

    /// Allocates `size` bytes whose address is a multiple of `alignment`.
    ///
    /// Alignments below [`MIN_ALIGNMENT`] are raised to it, and sizes below
    /// the size of a free-list node are raised to that, so every block can
    /// become a free block again. Fails with [`AllocError::OutOfMemory`] if
    /// no free block fits; the allocator is left unchanged in that case.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `alignment` is not a power of two.
    pub fn request_aligned_memory(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        assert!(size > 0, "Size must be greater than zero");
        assert!(
            alignment.is_power_of_two(),
            "Alignment must be a power of two (got {alignment})"
        );
        let alignment = alignment.max(MIN_ALIGNMENT);
        let size = size.max(NODE_SIZE);

        let Fit {
            prev,
            offset,
            node,
            padding,
        } = self
            .find_block(size, alignment)?
            .context(OutOfMemorySnafu {
                kind: KIND,
                requested: size,
                available: self.capacity - self.used,
            })?;

        let region = self.backing.region_mut()?;
        let required = padding + size;
        let leftover = node.size - required;
        let (block_size, link) = if leftover >= NODE_SIZE {
            let split = offset + required;
            region.write(
                split,
                FreeNode {
                    next: node.next,
                    size: leftover,
                },
            );
            (required, split)
        } else {
            (node.size, node.next)
        };
        match prev {
            Some(prev) => set_next(region, prev, link)?,
            None => self.head = (link != END_OF_LIST).then_some(link),
        }

        let payload = offset + padding;
        region.write(
            payload - HEADER_SIZE,
            AllocHeader {
                block_size,
                padding: padding - HEADER_SIZE,
            },
        );
        self.used += block_size;
        tracing::trace!(offset, block_size, policy = %self.policy, "free-list allocation");
        Ok(region.ptr_at(payload))
    }

    /// Returns a block to the free list, merging it with adjacent free
    /// blocks.
    ///
    /// A block that is already free is reported as
    /// [`AllocError::DoubleFree`] as long as its header survived; a header
    /// overwritten by the free-list node shows up as
    /// [`AllocError::CorruptHeader`]. Neither case modifies the allocator.
    pub fn return_memory(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let region = self.backing.region_mut()?;
        let payload = region
            .offset_of(ptr)
            .filter(|&payload| payload >= HEADER_SIZE && payload < self.capacity)
            .context(ForeignPointerSnafu {
                kind: KIND,
                addr: ptr.addr().get(),
            })?;

        let header_offset = payload - HEADER_SIZE;
        let header = region
            .read::<AllocHeader>(header_offset)
            .context(CorruptHeaderSnafu {
                kind: KIND,
                offset: header_offset,
            })?;
        let start = header_offset
            .checked_sub(header.padding)
            .filter(|&start| {
                header.block_size >= NODE_SIZE
                    && region.contains(start, header.block_size)
                    && start + header.block_size > payload
            })
            .context(CorruptHeaderSnafu {
                kind: KIND,
                offset: header_offset,
            })?;
        let end = start + header.block_size;

        // find the free blocks on either side of `start`
        let mut prev: Option<(usize, FreeNode)> = None;
        let mut next = self.head;
        while let Some(offset) = next {
            if offset >= start {
                break;
            }
            let node = read_node(region, offset)?;
            next = next_link(region, offset, &node)?;
            prev = Some((offset, node));
        }
        if let Some((offset, node)) = prev {
            ensure!(offset + node.size <= start, DoubleFreeSnafu { kind: KIND, offset: start });
        }
        if let Some(offset) = next {
            ensure!(offset >= end, DoubleFreeSnafu { kind: KIND, offset: start });
        }
        ensure!(
            header.block_size <= self.used,
            CorruptHeaderSnafu {
                kind: KIND,
                offset: header_offset
            }
        );

        let mut freed = FreeNode {
            next: next.unwrap_or(END_OF_LIST),
            size: header.block_size,
        };
        if next == Some(end) {
            let following = read_node(region, end)?;
            freed = FreeNode {
                next: following.next,
                size: freed.size + following.size,
            };
        }
        match prev {
            Some((offset, node)) if offset + node.size == start => {
                region.write(
                    offset,
                    FreeNode {
                        next: freed.next,
                        size: node.size + freed.size,
                    },
                );
            }
            Some((offset, node)) => {
                region.write(start, freed);
                region.write(offset, FreeNode { next: start, ..node });
            }
            None => {
                region.write(start, freed);
                self.head = Some(start);
            }
        }

        self.used -= header.block_size;
        tracing::trace!(offset = start, block_size = header.block_size, "free-list block returned");
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
        self.used = 0;
        self.head = None;
        Ok(())
    }

    /// Walks the free list and picks a block for `size` bytes at
    /// `alignment` according to the placement policy.
    fn find_block(&self, size: usize, alignment: usize) -> Result<Option<Fit>, AllocError> {
        let region = self.backing.region()?;
        let mut best: Option<Fit> = None;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(offset) = cursor {
            let node = read_node(region, offset)?;
            let padding = padding_with_header(region.addr() + offset, alignment, HEADER_SIZE);
            let fits = padding
                .checked_add(size)
                .is_some_and(|required| required <= node.size);
            if fits {
                let leftover = node.size - (padding + size);
                let better = best
                    .as_ref()
                    .is_none_or(|best| leftover < best.node.size - (best.padding + size));
                if better {
                    best = Some(Fit {
                        prev,
                        offset,
                        node,
                        padding,
                    });
                }
                if self.policy == PlacementPolicy::FindFirst {
                    break;
                }
            }
            prev = Some(offset);
            cursor = next_link(region, offset, &node)?;
        }
        Ok(best)
    }

    pub(crate) fn provide_child(&mut self, size: usize, align: usize) -> Result<Region, AllocError> {
        let ptr = self.request_aligned_memory(size, align)?;
        let region = self.backing.region()?;
        let offset = region
            .offset_of(ptr)
            .context(ForeignPointerSnafu {
                kind: KIND,
                addr: ptr.addr().get(),
            })?;
        let child = region.split_off(offset, size);
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

fn assert_capacity(capacity: usize) {
    assert!(
        capacity >= NODE_SIZE,
        "Capacity must be at least {NODE_SIZE} bytes to hold a free-list node"
    );
}

impl Drop for FreelistAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.free_memory() {
            tracing::warn!(%err, "free-list allocator dropped without releasing its buffer");
        }
    }
}
