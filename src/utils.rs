//! Helper functions for the allocator that don't particularly belong to any
//! concrete module of the program.

/// It aligns `to_be_aligned` upwards to a multiple of `alignment`.
///
/// This is used to round payload sizes to [`crate::ALIGNMENT`] and committed
/// spans to the page size. `alignment` must be a power of two.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of overflowing. User supplied
/// sizes go through this one.
#[inline]
pub const fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(padded) => Some(padded & !(alignment - 1)),
        None => None,
    }
}
