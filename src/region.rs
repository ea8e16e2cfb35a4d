use std::ptr::NonNull;

use log::{debug, warn};

use crate::{
    block::{ALIGNMENT, BLOCK_HEADER_SIZE, Block},
    error::{AllocatorError, Result},
    list::BlockList,
    platform::PlatformMemory,
    utils::{align, checked_align},
};

/// The contiguous address range the heap lives in.
///
/// The region starts as one reservation made by [`Region::init`] and only
/// ever grows at its end, one block at a time, through [`Region::grow`].
///
/// ```text
///  base                                                     base + size
///   |                                                            |
///   v                                                            v
///   +----------------------------+-------------+-----------------+
///   |      initial reservation   | grown block | grown block ... |
///   +----------------------------+-------------+-----------------+
/// ```
pub(crate) struct Region<P> {
    /// Where the bytes come from.
    platform: P,
    /// First byte of the heap, `None` until initialized.
    base: Option<NonNull<u8>>,
    /// Total bytes managed, headers included.
    size: usize,
}

impl<P> Region<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            base: None,
            size: 0,
        }
    }

    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last managed byte.
    #[inline]
    pub fn end(&self) -> Option<*mut u8> {
        self.base.map(|base| base.as_ptr().wrapping_add(self.size))
    }

    /// Forgets the heap. The memory is not handed back to the OS.
    pub fn teardown(&mut self, blocks: &mut BlockList) {
        if let Some(base) = self.base.take() {
            debug!("heap at {:p} torn down ({} bytes kept by the process)", base, self.size);
        }

        self.size = 0;
        blocks.clear();
    }
}

impl<P: PlatformMemory> Region<P> {
    /// Reserves `size` bytes (rounded up to [`ALIGNMENT`]) and installs one
    /// free block spanning all of them.
    ///
    /// Calling this twice without [`Region::teardown`] abandons the first
    /// reservation and every block in it.
    pub fn init(&mut self, size: usize, blocks: &mut BlockList) -> Result<()> {
        let size = checked_align(size, ALIGNMENT)
            .filter(|size| *size >= BLOCK_HEADER_SIZE + ALIGNMENT)
            .ok_or(AllocatorError::RegionTooSmall { size })?;

        let base = unsafe { self.platform.reserve(size) }.ok_or_else(|| {
            warn!("OS refused to reserve {size} bytes");
            AllocatorError::OsReservationFailed { size }
        })?;

        if base.as_ptr() as usize % ALIGNMENT != 0 {
            warn!("reservation at {:p} is not {ALIGNMENT}-byte aligned", base);
            return Err(AllocatorError::OsReservationFailed { size });
        }

        self.base = Some(base);
        self.size = size;

        blocks.clear();
        unsafe {
            blocks.push_back(base, size - BLOCK_HEADER_SIZE, true);
        }

        debug!("heap initialized at {:p} with {size} bytes", base);

        Ok(())
    }

    /// Extends the region by a header plus `extra` content bytes and appends
    /// them to `blocks` as a block that is already in use.
    ///
    /// `extra` must already be aligned. Fails with
    /// [`AllocatorError::HeapExhausted`] if the OS refuses or hands back bytes
    /// that don't start where the region ends; those bytes are abandoned.
    pub fn grow(&mut self, extra: usize, blocks: &mut BlockList) -> Result<NonNull<Block>> {
        debug_assert_eq!(extra, align(extra, ALIGNMENT));

        let end = self.end().ok_or(AllocatorError::Uninitialized)?;
        let exhausted = AllocatorError::HeapExhausted { requested: extra };
        let total = extra.checked_add(BLOCK_HEADER_SIZE).ok_or(exhausted)?;

        let start = unsafe { self.platform.extend(total) }.ok_or_else(|| {
            warn!("OS refused to extend the heap by {total} bytes");
            exhausted
        })?;

        if start.as_ptr() != end {
            warn!(
                "heap growth not contiguous: expected {:p}, got {:p}; {total} bytes abandoned",
                end, start
            );
            return Err(exhausted);
        }

        debug_assert!(
            blocks
                .last()
                .is_none_or(|tail| unsafe { Block::end(tail) } <= start.as_ptr())
        );

        self.size += total;
        let block = unsafe { blocks.push_back(start, extra, false) };

        debug!("heap grown by {total} bytes to {} bytes", self.size);

        Ok(block)
    }
}
