use snafu::{Location, Snafu};

use crate::AllocatorKind;

/// Errors reported by the allocators in this crate.
///
/// Every variant describes a condition the caller can observe and react to.
/// Wiring mistakes (zero-sized requests, alignments that are not a power of
/// two, pools whose chunks cannot hold a free-list node) are not represented
/// here; they panic.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display(
        "{kind} allocator is out of memory: requested {requested} bytes, {available} available"
    ))]
    OutOfMemory {
        kind: AllocatorKind,
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool allocator has no free chunk left ({item_count} in use)"))]
    PoolExhausted {
        item_count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "stack allocator blocks must be returned in reverse order: expected block #{expected}, got #{found}"
    ))]
    OrderViolation {
        expected: usize,
        found: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {addr:#x} was not handed out by this {kind} allocator"))]
    ForeignPointer {
        kind: AllocatorKind,
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{kind} allocator found a corrupt header at offset {offset:#x}"))]
    CorruptHeader {
        kind: AllocatorKind,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{kind} allocator block at offset {offset:#x} is already free"))]
    DoubleFree {
        kind: AllocatorKind,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "pool chunk of {chunk_size} bytes cannot hold a child buffer of {requested} bytes"
    ))]
    ChunkTooSmall {
        requested: usize,
        chunk_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer at {addr:#x} is not aligned to {align} bytes"))]
    MisalignedBuffer {
        addr: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{kind} allocator still backs {count} child allocator(s)"))]
    ChildrenOutstanding {
        kind: AllocatorKind,
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("parent {kind} allocator is already borrowed"))]
    ParentBusy {
        kind: AllocatorKind,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{kind} allocator has already released its buffer"))]
    Released {
        kind: AllocatorKind,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("system heap refused {size} bytes aligned to {align}"))]
    SystemHeap {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
