use std::{mem, ptr::NonNull};

use crate::utils::align;

/// Every payload size and every payload address handed out by the allocator
/// is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Header size of a block, rounded up so the payload that follows it stays
/// aligned to [`ALIGNMENT`].
pub const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Block>(), ALIGNMENT);

/// A split only happens when the leftover can host a header plus the smallest
/// possible payload. Anything smaller stays inside the allocated block.
pub(crate) const MIN_SPLIT_REMAINDER: usize = BLOCK_HEADER_SIZE + ALIGNMENT;

/// Non-null pointer to the next header, or the end of the ledger.
pub(crate) type Link = Option<NonNull<Block>>;

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |    is_free (1b)     |        | -> Header
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+ <------+ <--- pointer returned to the user
/// |       Content       |        |
/// |         ...         |        |
/// |         ...         |        | -> `size` bytes of addressable content
/// |         ...         |        |
/// +---------------------+ <------+ <--- next header, when adjacent
/// ```
///
/// Headers are never moved once written, so a payload pointer always gives
/// back its header by subtracting [`BLOCK_HEADER_SIZE`].
#[repr(C)]
pub(crate) struct Block {
    /// Size of the payload, header excluded.
    pub size: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
    /// Next block in address order.
    pub next: Link,
}

impl Block {
    /// Writes a new header at `addr` and returns a pointer to it.
    ///
    /// **SAFETY**: `addr` must be aligned to [`ALIGNMENT`] and valid for
    /// writes of [`BLOCK_HEADER_SIZE`] bytes.
    pub unsafe fn write(
        addr: NonNull<u8>,
        size: usize,
        is_free: bool,
        next: Link,
    ) -> NonNull<Block> {
        let block = addr.cast::<Block>();

        unsafe {
            block.as_ptr().write(Block { size, is_free, next });
        }

        block
    }

    /// First byte of the content described by `block`.
    ///
    /// **SAFETY**: `block` must point to a header inside the heap.
    #[inline]
    pub unsafe fn payload(block: NonNull<Block>) -> NonNull<u8> {
        unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
    }

    /// Address where the header of `ptr` would be if `ptr` was returned by
    /// this allocator. The result must not be dereferenced before checking
    /// it against the ledger.
    #[inline]
    pub fn header_of(ptr: *mut u8) -> *mut Block {
        ptr.wrapping_sub(BLOCK_HEADER_SIZE).cast()
    }

    /// One past the last content byte of `block`.
    ///
    /// **SAFETY**: `block` must point to a live header.
    #[inline]
    pub unsafe fn end(block: NonNull<Block>) -> *mut u8 {
        unsafe { Block::payload(block).as_ptr().add(block.as_ref().size) }
    }

    /// Whether `next` starts exactly where `block` ends.
    ///
    /// **SAFETY**: `block` must point to a live header.
    #[inline]
    pub unsafe fn is_adjacent(block: NonNull<Block>, next: NonNull<Block>) -> bool {
        unsafe { Block::end(block) == next.as_ptr().cast() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keeps_payload_aligned() {
        assert_eq!(BLOCK_HEADER_SIZE % ALIGNMENT, 0);
        assert!(BLOCK_HEADER_SIZE >= mem::size_of::<Block>());
    }

    #[test]
    fn header_round_trip() {
        let mut buffer = [0u64; 16];
        let addr = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
            let block = Block::write(addr, 64, false, None);
            let payload = Block::payload(block);

            assert_eq!(payload.as_ptr() as usize - addr.as_ptr() as usize, BLOCK_HEADER_SIZE);
            assert_eq!(Block::header_of(payload.as_ptr()), block.as_ptr());
            assert_eq!(Block::end(block), payload.as_ptr().add(64));
        }
    }

    #[test]
    fn adjacency() {
        let mut buffer = [0u64; 32];
        let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
            let first = Block::write(base, 16, true, None);
            let second = Block::write(base.add(BLOCK_HEADER_SIZE + 16), 8, true, None);
            let gap = Block::write(base.add(2 * BLOCK_HEADER_SIZE + 32), 8, true, None);

            assert!(Block::is_adjacent(first, second));
            assert!(!Block::is_adjacent(second, gap));
        }
    }
}
