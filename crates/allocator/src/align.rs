//! Alignment arithmetic shared by every allocator in this crate.
//!
//! All functions work on plain addresses (`usize`). Alignments must be powers
//! of two; passing anything else is a programming error and panics.

/// Upper bound for the alignment requested when a child allocator carves its
/// buffer out of a parent.
pub const MAX_CHILD_ALIGN: usize = 64;

fn assert_power_of_two(align: usize) {
    assert!(
        align.is_power_of_two(),
        "Alignment must be a power of two (got {align})"
    );
}

/// Returns the smallest address greater than or equal to `addr` that is a
/// multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two, or if the aligned address
/// overflows `usize`.
///
/// # Examples
///
/// ```
/// use allocator::align::align_forward;
///
/// assert_eq!(align_forward(13, 8), 16);
/// assert_eq!(align_forward(16, 8), 16);
/// assert_eq!(align_forward(0, 64), 0);
/// ```
#[must_use]
pub fn align_forward(addr: usize, align: usize) -> usize {
    assert_power_of_two(align);
    let mask = align - 1;
    addr.checked_add(mask)
        .expect("aligned address overflows usize")
        & !mask
}

/// Returns `true` if `addr` is a multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[must_use]
pub fn is_aligned(addr: usize, align: usize) -> bool {
    assert_power_of_two(align);
    addr & (align - 1) == 0
}

/// Computes the padding needed to place a `header_size`-byte header directly
/// in front of an `align`-aligned payload.
///
/// The returned value counts from `addr` to the payload, so it includes the
/// header itself: the header starts at `addr + padding - header_size` and the
/// payload at `addr + padding`. When the plain alignment padding is too small
/// to hold the header, whole multiples of `align` are added until it fits.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
///
/// # Examples
///
/// ```
/// use allocator::align::padding_with_header;
///
/// // already aligned: a full alignment step is needed for a 16-byte header
/// assert_eq!(padding_with_header(64, 16, 16), 16);
/// // 4 bytes of alignment slack cannot hold the header, so add 8 more
/// assert_eq!(padding_with_header(4, 8, 16), 20);
/// ```
#[must_use]
pub fn padding_with_header(addr: usize, align: usize, header_size: usize) -> usize {
    assert_power_of_two(align);
    let modulo = addr & (align - 1);
    let mut padding = if modulo == 0 { 0 } else { align - modulo };
    if padding < header_size {
        let needed = header_size - padding;
        padding += needed.div_ceil(align) * align;
    }
    padding
}

/// Alignment a child allocator asks its parent for when it requests a buffer
/// of `size` bytes.
///
/// The child's own size is used as the alignment, rounded up to a power of
/// two and capped at [`MAX_CHILD_ALIGN`].
#[must_use]
pub fn child_buffer_align(size: usize) -> usize {
    size.max(1)
        .checked_next_power_of_two()
        .map_or(MAX_CHILD_ALIGN, |align| align.min(MAX_CHILD_ALIGN))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_forward() {
        for align in [1, 2, 4, 8, 16, 32, 64] {
            for addr in 0..256 {
                let aligned = align_forward(addr, align);
                assert!(aligned >= addr);
                assert!(aligned - addr < align);
                assert_eq!(aligned % align, 0);
            }
        }
    }

    #[test]
    #[should_panic = "Alignment must be a power of two"]
    fn test_align_forward_rejects_non_power_of_two() {
        let _ = align_forward(10, 12);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(0, 8));
        assert!(is_aligned(128, 64));
        assert!(!is_aligned(130, 4));
        assert!(is_aligned(7, 1));
    }

    #[test]
    fn test_padding_with_header() {
        const HEADER: usize = 16;
        for align in [1, 2, 4, 8, 16, 32, 64] {
            for addr in 0..256 {
                let padding = padding_with_header(addr, align, HEADER);
                assert!(padding >= HEADER);
                assert_eq!((addr + padding) % align, 0);
                // never more than one alignment step beyond the minimum
                assert!(padding < HEADER + align);
            }
        }
    }

    #[test]
    fn test_padding_with_header_exact_fit() {
        // 16 bytes of natural padding are exactly enough for the header
        assert_eq!(padding_with_header(48, 64, 16), 16);
        assert_eq!(padding_with_header(40, 64, 16), 24);
        assert_eq!(padding_with_header(56, 64, 16), 72);
    }

    #[test]
    fn test_child_buffer_align() {
        assert_eq!(child_buffer_align(0), 1);
        assert_eq!(child_buffer_align(1), 1);
        assert_eq!(child_buffer_align(24), 32);
        assert_eq!(child_buffer_align(64), 64);
        assert_eq!(child_buffer_align(1000), MAX_CHILD_ALIGN);
        assert_eq!(child_buffer_align(usize::MAX), MAX_CHILD_ALIGN);
    }
}
