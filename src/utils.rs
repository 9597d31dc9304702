//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

use crate::block::ALIGNMENT;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This method is used to align commit sizes to be a multiple of the page size
/// and block sizes to be a multiple of [`ALIGNMENT`].
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around.
#[inline]
pub const fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(aligment - 1) {
        Some(value) => Some(value & !(aligment - 1)),
        None => None,
    }
}

/// Rounds `size` up to the block granularity.
#[inline]
pub const fn align8(size: usize) -> usize {
    align(size, ALIGNMENT)
}
