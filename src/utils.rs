//! This file contains the helper functions for the allocator.
//! These are functions that don't particularly belong to any concrete module of the program.

/// Every payload handed out by the heap is aligned to this many bytes, and every
/// block size is a multiple of it.
pub const ALIGNMENT: usize = 16;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used both to round block sizes up to a multiple of [`ALIGNMENT`]
/// and to round chunk sizes up to a multiple of the page size.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Rounds `value` down to a multiple of `aligment` (a power of two).
#[inline]
pub const fn align_down(value: usize, aligment: usize) -> usize {
    value & !(aligment - 1)
}

/// Whether `addr` is a multiple of `aligment`.
#[inline]
pub const fn is_aligned(addr: usize, aligment: usize) -> bool {
    addr & (aligment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_alignment_unit() {
        let aligments = vec![(1..16, 16), (17..32, 32), (33..48, 48), (49..64, 64)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, ALIGNMENT));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let aligments = vec![(1..4096, 4096), (4097..8192, 8192)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn aligned_values_are_kept() {
        assert_eq!(0, align(0, ALIGNMENT));
        assert_eq!(4096, align(4096, 4096));
        assert_eq!(4096, align_down(4097, 4096));
        assert_eq!(4096, align_down(8191, 4096));
        assert!(is_aligned(64, ALIGNMENT));
        assert!(!is_aligned(72, ALIGNMENT));
    }
}
