//! Raw buffer access.
//!
//! Every byte an allocator in this crate touches goes through a [`Region`].
//! A region is a pointer and a length; all typed reads and writes are
//! addressed by offset from the region start and are bounds-checked before
//! the pointer is dereferenced. Headers and free-list nodes stored inside
//! managed memory are [`Pod`] types, so reading back whatever bytes a client
//! left behind never produces an invalid value: at worst the allocator sees
//! a garbage header and reports it.
//!
//! This module is the only place in the crate that dereferences raw pointers.

use core::ptr::{self, NonNull};

use dataview::Pod;

/// A contiguous byte buffer owned by exactly one allocator.
///
/// The region does not know who owns the memory; the owning allocator keeps
/// the ownership record alongside it.
#[derive(Debug, PartialEq, Eq)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Creates a region describing `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr..ptr + len` is valid for reads and writes
    /// - the memory is not used by anything else while the region exists,
    ///   except through pointers the region itself hands out
    /// - the memory stays valid for as long as the region is alive
    pub(crate) unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        assert!(
            ptr.addr().get().checked_add(len).is_some(),
            "Region must not wrap around the address space"
        );
        Self { ptr, len }
    }

    /// Start address of the region.
    pub(crate) fn addr(&self) -> usize {
        self.ptr.addr().get()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns a pointer to `offset` bytes past the start.
    ///
    /// `offset == len` is allowed and yields the one-past-the-end pointer.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "Offset {offset:#x} out of region bounds");
        // SAFETY: `offset` is within the allocation, or one past its end
        unsafe { self.ptr.add(offset) }
    }

    /// Converts a pointer previously produced by [`ptr_at`](Self::ptr_at)
    /// back into an offset.
    ///
    /// Returns `None` if `ptr` lies outside `start..=end`.
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.addr().get().checked_sub(self.addr())?;
        (offset <= self.len).then_some(offset)
    }

    /// Returns `true` if `size` bytes starting at `offset` lie within the
    /// region.
    pub(crate) fn contains(&self, offset: usize, size: usize) -> bool {
        offset
            .checked_add(size)
            .is_some_and(|end| end <= self.len)
    }

    /// Reads a `T` stored at `offset`.
    ///
    /// Returns `None` if the value would extend past the end of the region.
    pub(crate) fn read<T>(&self, offset: usize) -> Option<T>
    where
        T: Pod + Copy,
    {
        if !self.contains(offset, size_of::<T>()) {
            return None;
        }
        // SAFETY: the bytes are in bounds and `T: Pod` accepts any bit
        // pattern, including bytes a client wrote there.
        Some(unsafe { self.ptr.add(offset).cast::<T>().read_unaligned() })
    }

    /// Writes `value` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the value would extend past the end of the region.
    pub(crate) fn write<T>(&mut self, offset: usize, value: T)
    where
        T: Pod,
    {
        assert!(
            self.contains(offset, size_of::<T>()),
            "Write of {} bytes at {offset:#x} out of region bounds",
            size_of::<T>()
        );
        // SAFETY: the bytes are in bounds and exclusively owned by the region
        unsafe { self.ptr.add(offset).cast::<T>().write_unaligned(value) }
    }

    /// Fills `len` bytes starting at `offset` with `byte`.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of the region.
    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(
            self.contains(offset, len),
            "Fill of {len} bytes at {offset:#x} out of region bounds"
        );
        // SAFETY: the bytes are in bounds and exclusively owned by the region
        unsafe { ptr::write_bytes(self.ptr.add(offset).as_ptr(), byte, len) }
    }

    /// Creates a sub-region of `len` bytes starting at `offset`.
    ///
    /// The sub-region aliases this one; the caller hands it to a child
    /// allocator and must not touch those bytes until it is given back.
    pub(crate) fn split_off(&self, offset: usize, len: usize) -> Self {
        assert!(
            self.contains(offset, len),
            "Sub-region of {len} bytes at {offset:#x} out of region bounds"
        );
        Self {
            ptr: self.ptr_at(offset),
            len,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
    struct Pair {
        a: usize,
        b: usize,
    }

    fn with_region<F>(len: usize, test_fn: F)
    where
        F: FnOnce(&mut Region),
    {
        let mut storage = vec![0u8; len];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        let mut region = unsafe { Region::new(ptr, len) };
        test_fn(&mut region);
    }

    #[test]
    fn test_read_write() {
        with_region(64, |region| {
            region.write(3, Pair { a: 1, b: 2 });
            assert_eq!(region.read::<Pair>(3), Some(Pair { a: 1, b: 2 }));
            assert_eq!(region.read::<Pair>(64 - size_of::<Pair>() + 1), None);
            assert_eq!(region.read::<u8>(64), None);
        });
    }

    #[test]
    #[should_panic = "out of region bounds"]
    fn test_write_out_of_bounds() {
        with_region(16, |region| region.write(12, 0usize));
    }

    #[test]
    fn test_offset_of() {
        with_region(32, |region| {
            let ptr = region.ptr_at(10);
            assert_eq!(region.offset_of(ptr), Some(10));
            assert_eq!(region.offset_of(region.ptr_at(32)), Some(32));

            let outside = NonNull::new(region.addr().wrapping_add(33) as *mut u8).unwrap();
            assert_eq!(region.offset_of(outside), None);
        });
    }

    #[test]
    fn test_fill_and_split() {
        with_region(32, |region| {
            region.fill(0, 32, 0xaa);
            let mut sub = region.split_off(8, 8);
            assert_eq!(sub.addr(), region.addr() + 8);
            sub.fill(0, 8, 0x55);
            assert_eq!(region.read::<u8>(7), Some(0xaa));
            assert_eq!(region.read::<u8>(8), Some(0x55));
            assert_eq!(region.read::<u8>(15), Some(0x55));
            assert_eq!(region.read::<u8>(16), Some(0xaa));
        });
    }
}
