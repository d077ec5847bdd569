//! Composable allocators over raw byte buffers.
//!
//! Every allocator in this crate manages one contiguous buffer and hands out
//! pieces of it. The buffer itself can come from three places:
//!
//! - the [`SystemHeap`], a metrics handle over the global allocator
//! - memory owned by the caller (`from_external` constructors)
//! - another allocator of this crate (`with_parent` constructors), forming a
//!   tree of memory providers
//!
//! `free_memory` always gives the buffer back to exactly the entity that
//! supplied it, and `Drop` does the same for allocators that were never
//! freed explicitly.
//!
//! # Available Allocators
//!
//! ## [`LinearAllocator`]
//!
//! Bump allocation with bulk reset. No per-allocation overhead and no
//! individual free.
//!
//! ## [`StackAllocator`]
//!
//! LIFO allocation. Each block carries a small header; blocks must be
//! returned in reverse order, and out-of-order returns are refused instead of
//! corrupting the stack.
//!
//! ## [`PoolAllocator`]
//!
//! Fixed-size chunks threaded on an intrusive free list. O(1) request and
//! return, no fragmentation.
//!
//! ## [`FreelistAllocator`]
//!
//! Variable-size allocation from an address-ordered free list, with
//! first-fit or best-fit placement ([`PlacementPolicy`]), splitting on
//! allocation and coalescing on return.
//!
//! # Usage Examples
//!
//! ## Free-list allocation
//!
//! ```rust
//! use allocator::{FreelistAllocator, PlacementPolicy, SystemHeap};
//!
//! let heap = SystemHeap::new();
//! let mut allocator = FreelistAllocator::new(4096, PlacementPolicy::FindBest, &heap).unwrap();
//!
//! let a = allocator.request_memory(100).unwrap();
//! let b = allocator.request_aligned_memory(256, 64).unwrap();
//! assert_eq!(b.addr().get() % 64, 0);
//!
//! allocator.return_memory(a).unwrap();
//! allocator.return_memory(b).unwrap();
//! assert_eq!(allocator.free_blocks().count(), 1);
//!
//! allocator.free_memory().unwrap();
//! assert_eq!(heap.active_allocations(), 0);
//! ```
//!
//! ## Allocator trees
//!
//! ```rust
//! use std::rc::Rc;
//!
//! use allocator::{LinearAllocator, PoolAllocator, SystemHeap, share};
//!
//! let heap = SystemHeap::new();
//! let pool = share(PoolAllocator::new(4, 256, 64, &heap).unwrap());
//!
//! // a per-frame arena living in one chunk of the pool
//! let mut frame = LinearAllocator::with_parent(256, Rc::clone(&pool)).unwrap();
//! assert_eq!(pool.borrow().free_item_count(), 3);
//!
//! frame.request_memory(64).unwrap();
//! frame.free_memory().unwrap();
//! assert_eq!(pool.borrow().free_item_count(), 4);
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Headers and free-list nodes live inside the managed buffers. All access to
//! them goes through one bounds-checked type, [`Region`], and is expressed as
//! offsets from the buffer start. Pointers handed to callers are raw
//! [`NonNull<u8>`](core::ptr::NonNull); what the caller does with them is the
//! caller's responsibility, as with any allocator.
//!
//! ## Thread Safety
//!
//! None of the types are `Send` or `Sync`. Parents are shared through
//! [`Shared`] (`Rc<RefCell<_>>`) handles.
//!
//! ## Performance Characteristics
//!
//! | Allocator | Request | Return | Overhead per allocation |
//! |-----------|---------|--------|-------------------------|
//! | `LinearAllocator` | O(1) | n/a | alignment padding |
//! | `StackAllocator` | O(1) | O(1) | 16-byte header + padding |
//! | `PoolAllocator` | O(1) | O(1) | rounding to chunk size |
//! | `FreelistAllocator` | O(n) | O(n) | 16-byte header + padding |
//!
//! *n is the number of free blocks.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod align;
mod error;
mod freelist;
mod heap;
mod linear;
mod owner;
mod pool;
mod region;
mod stack;

pub use self::{
    error::AllocError,
    freelist::{FreelistAllocator, MIN_ALIGNMENT, PlacementPolicy},
    heap::{MIN_BUFFER_ALIGN, SystemHeap},
    linear::LinearAllocator,
    owner::{AllocatorKind, ParentAllocator, Shared, share},
    pool::{MIN_CHUNK_SIZE, PoolAllocator},
    region::Region,
    stack::StackAllocator,
};
