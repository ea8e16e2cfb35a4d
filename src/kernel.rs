use std::ptr::{self, NonNull};

use log::{trace, warn};

use crate::{
    block::{ALIGNMENT, BLOCK_HEADER_SIZE, Block, Link, MIN_SPLIT_REMAINDER},
    error::Result,
    list::BlockList,
    platform::PlatformMemory,
    region::Region,
    utils::checked_align,
};

/// The internal data structure of the allocator: the heap region plus the
/// ledger of blocks carved out of it.
///
/// Nothing in here locks. Every method assumes exclusive access, which
/// [`crate::MemAlloc`] provides by wrapping the kernel in a mutex. Internal
/// reuse (reallocate falling back to allocate and free) goes through these
/// methods directly so the lock is only ever taken once per call.
pub(crate) struct Kernel<P> {
    /// Memory obtained from the OS.
    region: Region<P>,
    /// Every block of the region, in address order.
    blocks: BlockList,
}

// SAFETY: the raw pointers held by the kernel point into memory it owns
// exclusively, so moving it to another thread moves that ownership too.
unsafe impl<P: Send> Send for Kernel<P> {}

/// A point-in-time view of the ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap, headers included.
    pub heap_size: usize,
    /// Number of blocks in the ledger.
    pub blocks: usize,
    /// Number of blocks available for reuse.
    pub free_blocks: usize,
    /// Content bytes available across all free blocks.
    pub free_bytes: usize,
    /// Content bytes currently handed out.
    pub used_bytes: usize,
    /// Content size of the biggest free block.
    pub largest_free: usize,
}

impl<P> Kernel<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            region: Region::new(platform),
            blocks: BlockList::new(),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.base().is_some()
    }

    /// Drops all bookkeeping. Pointers handed out before are dangling from
    /// the allocator's point of view.
    pub fn cleanup(&mut self) {
        self.region.teardown(&mut self.blocks);
    }

    /// Returns the block whose content starts at `ptr`, as long as it's a live
    /// entry of the ledger. Blocks swallowed by a merge are not found.
    fn lookup(&self, ptr: *mut u8) -> Link {
        self.blocks.find(Block::header_of(ptr))
    }

    /// First-fit search: the first free block with at least `size` bytes of
    /// content, scanning from the heap base.
    fn find_free_block(&self, size: usize) -> Link {
        self.blocks
            .iter()
            .find(|block| unsafe { block.as_ref().is_free && block.as_ref().size >= size })
    }

    /// Shrinks `block` to `size` bytes and turns the leftover into a new free
    /// block right after it. Leftovers that can't hold a header plus one word
    /// stay inside `block`.
    unsafe fn split_block(&mut self, mut block: NonNull<Block>, size: usize) {
        unsafe {
            let available = block.as_ref().size;

            if available < size + MIN_SPLIT_REMAINDER {
                return;
            }

            let remainder = Block::payload(block).add(size);
            let remainder_size = available - size - BLOCK_HEADER_SIZE;

            self.blocks.insert_after(block, remainder, remainder_size, true);
            block.as_mut().size = size;

            trace!("split {:p}: {size} used, {remainder_size} free at {:p}", block, remainder);
        }
    }

    /// Merges every run of address-adjacent free blocks into its first block.
    ///
    /// The ledger is in address order, so a single forward walk reaches the
    /// fixed point: after a merge we stay on the same block and look at its
    /// new successor.
    fn coalesce(&mut self) -> usize {
        let mut merged = 0;
        let mut current = self.blocks.first();

        while let Some(block) = current {
            unsafe {
                match block.as_ref().next {
                    Some(next)
                        if block.as_ref().is_free
                            && next.as_ref().is_free
                            && Block::is_adjacent(block, next) =>
                    {
                        self.blocks.absorb_next(block);
                        merged += 1;
                    }
                    next => current = next,
                }
            }
        }

        merged
    }

    /// Content size of the live, used block at `ptr`. Zero for anything else.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }

        self.lookup(ptr)
            .filter(|block| unsafe { !block.as_ref().is_free })
            .map_or(0, |block| unsafe { block.as_ref().size })
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.region.size(),
            blocks: self.blocks.len(),
            ..HeapStats::default()
        };

        for block in &self.blocks {
            let (size, is_free) = unsafe { (block.as_ref().size, block.as_ref().is_free) };

            if is_free {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free = stats.largest_free.max(size);
            } else {
                stats.used_bytes += size;
            }
        }

        stats
    }
}

impl<P: PlatformMemory> Kernel<P> {
    pub fn init(&mut self, size: usize) -> Result<()> {
        self.region.init(size, &mut self.blocks)
    }

    /// Hands out at least `size` bytes, growing the heap if no free block is
    /// big enough. `None` for zero-sized requests and when the heap can't
    /// grow.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let Some(aligned) = checked_align(size, ALIGNMENT) else {
            warn!("allocate({size}) rejected: size overflows");
            return None;
        };

        let block = match self.find_free_block(aligned) {
            Some(mut block) => unsafe {
                block.as_mut().is_free = false;
                self.split_block(block, aligned);
                block
            },
            None => match self.region.grow(aligned, &mut self.blocks) {
                Ok(block) => block,
                Err(err) => {
                    warn!("allocate({size}) failed: {err}");
                    return None;
                }
            },
        };

        let payload = unsafe { Block::payload(block) };
        trace!("allocate({size}) -> {:p}", payload);

        Some(payload)
    }

    /// Gives the block at `ptr` back and merges it with its free neighbours.
    ///
    /// Null and foreign pointers are ignored, and so is a repeated free while
    /// the block is still free. Once its address has been handed out again a
    /// second free releases the new owner's block.
    ///
    /// **SAFETY**: `ptr` must not have been freed already and must not be in
    /// use by anyone after this call.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let Some(mut block) = self.lookup(ptr) else {
            warn!("free({:p}) ignored: not a block of this heap", ptr);
            return;
        };

        unsafe {
            if block.as_ref().is_free {
                warn!("free({:p}) ignored: block is already free", ptr);
                return;
            }

            block.as_mut().is_free = true;
        }

        let merged = self.coalesce();
        trace!("free({:p}), {merged} merges", ptr);
    }

    /// Resizes the block at `ptr` to hold at least `new_size` bytes, moving
    /// it if it doesn't already.
    ///
    /// **SAFETY**: `ptr` must be null or a pointer returned by this kernel
    /// that has not been freed already. On a move the old pointer is freed.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }

        if new_size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }

        let old_size = self.usable_size(ptr);

        if old_size == 0 {
            warn!("reallocate({:p}, {new_size}) ignored: not an allocated block", ptr);
            return None;
        }

        if old_size >= new_size {
            trace!("reallocate({:p}, {new_size}) kept in place", ptr);
            return NonNull::new(ptr);
        }

        // The old block is still in use here, so the new one can't overlap it.
        let new_ptr = self.allocate(new_size)?;

        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(new_size));
            self.free(ptr);
        }

        trace!("reallocate({:p}, {new_size}) moved to {:p}", ptr, new_ptr);

        Some(new_ptr)
    }
}
