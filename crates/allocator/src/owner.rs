//! Ownership routing between allocators.
//!
//! An allocator's buffer comes from one of three places: memory the caller
//! manages, the [`SystemHeap`], or another allocator. The record is kept next to the buffer so that
//! `free_memory` hands the buffer back to exactly the entity that supplied
//! it.
//!
//! Parents are shared handles ([`Shared`]). A child keeps its parent's handle
//! until it releases its buffer, so a parent can never be dropped while a
//! child still lives inside its memory. Releasing a parent's buffer
//! explicitly while children are outstanding is refused with
//! [`AllocError::ChildrenOutstanding`].

use alloc::rc::Rc;
use core::{
    cell::{RefCell, RefMut},
    ptr::NonNull,
};

use derive_more::{Display, From, IsVariant};
use snafu::OptionExt as _;

use crate::{
    AllocError, FreelistAllocator, LinearAllocator, PoolAllocator, Region, StackAllocator,
    error::{ParentBusySnafu, ReleasedSnafu},
    heap::{HeapLease, SystemHeap},
};

/// Shared, single-threaded handle to an allocator that other allocators can
/// use as their parent.
pub type Shared<T> = Rc<RefCell<T>>;

/// Wraps an allocator into a [`Shared`] handle.
pub fn share<T>(allocator: T) -> Shared<T> {
    Rc::new(RefCell::new(allocator))
}

/// The closed set of memory providers an allocator can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IsVariant)]
pub enum AllocatorKind {
    /// Memory owned by the caller; never freed by an allocator.
    #[display("external")]
    External,
    /// The system heap.
    #[display("default")]
    Default,
    #[display("linear")]
    Linear,
    #[display("stack")]
    Stack,
    #[display("pool")]
    Pool,
    #[display("free-list")]
    GeneralFreelist,
}

/// An allocator that can supply and reclaim child buffers.
#[derive(Debug, Clone, From, IsVariant)]
pub enum ParentAllocator {
    Linear(Shared<LinearAllocator>),
    Stack(Shared<StackAllocator>),
    Pool(Shared<PoolAllocator>),
    Freelist(Shared<FreelistAllocator>),
}

fn borrow<T>(kind: AllocatorKind, shared: &Shared<T>) -> Result<RefMut<'_, T>, AllocError> {
    shared.try_borrow_mut().ok().context(ParentBusySnafu { kind })
}

impl ParentAllocator {
    #[must_use]
    pub fn kind(&self) -> AllocatorKind {
        match self {
            Self::Linear(_) => AllocatorKind::Linear,
            Self::Stack(_) => AllocatorKind::Stack,
            Self::Pool(_) => AllocatorKind::Pool,
            Self::Freelist(_) => AllocatorKind::GeneralFreelist,
        }
    }

    /// Requests a `size`-byte buffer aligned to `align` from the parent.
    ///
    /// Pools ignore `align`: they hand out whole chunks and only check that
    /// `size` fits in one.
    fn provide(&self, size: usize, align: usize) -> Result<Region, AllocError> {
        let kind = self.kind();
        match self {
            Self::Linear(parent) => borrow(kind, parent)?.provide_child(size, align),
            Self::Stack(parent) => borrow(kind, parent)?.provide_child(size, align),
            Self::Pool(parent) => borrow(kind, parent)?.provide_child(size),
            Self::Freelist(parent) => borrow(kind, parent)?.provide_child(size, align),
        }
    }

    /// Gives a buffer obtained through [`provide`](Self::provide) back.
    fn reclaim(&self, region: &Region) -> Result<(), AllocError> {
        let kind = self.kind();
        let ptr = region.as_ptr();
        match self {
            Self::Linear(parent) => {
                borrow(kind, parent)?.reclaim_child();
                Ok(())
            }
            Self::Stack(parent) => borrow(kind, parent)?.reclaim_child(ptr),
            Self::Pool(parent) => borrow(kind, parent)?.reclaim_child(ptr),
            Self::Freelist(parent) => borrow(kind, parent)?.reclaim_child(ptr),
        }
    }
}

/// Who supplied an allocator's buffer.
#[derive(Debug)]
pub(crate) enum Owner {
    External,
    System(HeapLease),
    Parent(ParentAllocator),
}

impl Owner {
    fn kind(&self) -> AllocatorKind {
        match self {
            Self::External => AllocatorKind::External,
            Self::System(_) => AllocatorKind::Default,
            Self::Parent(parent) => parent.kind(),
        }
    }
}

/// A buffer together with its ownership record.
#[derive(Debug)]
pub(crate) struct Backing {
    kind: AllocatorKind,
    lease: Option<(Region, Owner)>,
}

impl Backing {
    pub(crate) fn system(
        kind: AllocatorKind,
        heap: &SystemHeap,
        size: usize,
        align: usize,
    ) -> Result<Self, AllocError> {
        let (region, lease) = heap.allocate(size, align)?;
        Ok(Self {
            kind,
            lease: Some((region, Owner::System(lease))),
        })
    }

    pub(crate) fn from_parent(
        kind: AllocatorKind,
        parent: ParentAllocator,
        size: usize,
        align: usize,
    ) -> Result<Self, AllocError> {
        assert!(size > 0, "Buffer size must be greater than zero");
        let region = parent.provide(size, align)?;
        tracing::debug!(
            %kind,
            parent = %parent.kind(),
            size,
            addr = region.addr(),
            "buffer carved from parent"
        );
        Ok(Self {
            kind,
            lease: Some((region, Owner::Parent(parent))),
        })
    }

    /// # Safety
    ///
    /// `ptr..ptr + size` must be valid for reads and writes, must not be used
    /// by anything else, and must outlive the allocator.
    pub(crate) unsafe fn external(kind: AllocatorKind, ptr: NonNull<u8>, size: usize) -> Self {
        assert!(size > 0, "Buffer size must be greater than zero");
        // SAFETY: forwarded to the caller
        let region = unsafe { Region::new(ptr, size) };
        Self {
            kind,
            lease: Some((region, Owner::External)),
        }
    }

    pub(crate) fn region(&self) -> Result<&Region, AllocError> {
        self.lease
            .as_ref()
            .map(|(region, _)| region)
            .context(ReleasedSnafu { kind: self.kind })
    }

    pub(crate) fn region_mut(&mut self) -> Result<&mut Region, AllocError> {
        self.lease
            .as_mut()
            .map(|(region, _)| region)
            .context(ReleasedSnafu { kind: self.kind })
    }

    pub(crate) fn parent_kind(&self) -> Option<AllocatorKind> {
        self.lease.as_ref().map(|(_, owner)| owner.kind())
    }

    pub(crate) fn is_released(&self) -> bool {
        self.lease.is_none()
    }

    /// Hands the buffer back to its owner.
    ///
    /// Does nothing if the buffer was already released. If the owner refuses
    /// the buffer (a stack parent with younger blocks still live, a busy
    /// parent), the buffer stays attached and the error is returned.
    pub(crate) fn release(&mut self) -> Result<(), AllocError> {
        let Some((region, owner)) = self.lease.take() else {
            return Ok(());
        };
        match owner {
            Owner::External => {}
            Owner::System(lease) => lease.release(region),
            Owner::Parent(parent) => {
                if let Err(err) = parent.reclaim(&region) {
                    self.lease = Some((region, Owner::Parent(parent)));
                    return Err(err);
                }
                tracing::debug!(kind = %self.kind, parent = %parent.kind(), "buffer returned to parent");
            }
        }
        Ok(())
    }
}
