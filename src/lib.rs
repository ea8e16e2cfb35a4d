//! # heapmalloc
//!
//! A first-fit heap allocator that manages one growable region of memory
//! obtained from the OS, with `init` / `allocate` / `free` / `reallocate` /
//! `cleanup` entry points in the spirit of `malloc`.
//!
//! ```text
//!   base                                                            break
//!    |                                                                |
//!    v                                                                v
//!    +--------+---------+--------+--------+--------+---------+--------+
//!    | Header | Content | Header |  Free  | Header | Content | Header | ...
//!    +--------+---------+--------+--------+--------+---------+--------+
//!        |                  ^  |              ^ |                ^
//!        +------------------+  +--------------+ +----------------+
//!                          next              next
//! ```
//!
//! Every block is a [`BLOCK_HEADER_SIZE`]-byte header followed by its content.
//! Headers form a singly linked list in address order starting at the heap
//! base:
//!
//! - **allocate** walks the list and takes the first free block that fits,
//!   splitting off the rest when it can host another block. If nothing fits
//!   the heap grows by exactly one block at its end.
//! - **free** marks the block free and merges every run of adjacent free
//!   blocks.
//! - **reallocate** keeps the block when it's already big enough, otherwise
//!   moves the content to a new block.
//!
//! All sizes are rounded up to [`ALIGNMENT`] bytes and every returned pointer
//! is aligned to it. Nothing stronger is guaranteed.
//!
//! ## Usage
//!
//! ```rust
//! use heapmalloc::MemAlloc;
//!
//! let heap = MemAlloc::new();
//! heap.init(1024).unwrap();
//!
//! let ptr = heap.allocate(128).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0, 128);
//!     let ptr = heap.reallocate(ptr.as_ptr(), 256).unwrap();
//!     heap.free(ptr.as_ptr());
//! }
//!
//! heap.cleanup();
//! ```
//!
//! ## Threads
//!
//! Every public method takes the allocator's lock once and releases it before
//! returning, so calls from different threads are totally ordered. A
//! [`MemAlloc`] can live in a `static` since [`MemAlloc::new`] is `const`.
//!
//! ## Limitations
//!
//! - Memory is never returned to the OS, not even by [`MemAlloc::cleanup`].
//! - Search and merging are linear in the number of blocks.
//! - Freeing a pointer that is still used elsewhere, freeing it twice, or
//!   using one after freeing it is undefined behavior. A second free is only
//!   caught while the block hasn't been handed out again.

mod block;
mod error;
mod kernel;
mod list;
pub mod platform;
mod region;
mod utils;

use std::ptr::NonNull;

use parking_lot::Mutex;

pub use block::{ALIGNMENT, BLOCK_HEADER_SIZE};
pub use error::{AllocatorError, Result};
pub use kernel::HeapStats;
#[cfg(target_os = "linux")]
pub use platform::ProgramBreak;
pub use platform::{PlatformMemory, VirtualMemory};

use kernel::Kernel;

/// Handle to a heap. All the state lives behind a single mutex.
pub struct MemAlloc<P = VirtualMemory> {
    kernel: Mutex<Kernel<P>>,
}

impl MemAlloc<VirtualMemory> {
    /// Heap backed by a private reservation of
    /// [`platform::DEFAULT_RESERVATION`] bytes of address space.
    pub const fn new() -> Self {
        Self::with_platform(VirtualMemory::new())
    }
}

impl Default for MemAlloc<VirtualMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformMemory> MemAlloc<P> {
    pub const fn with_platform(platform: P) -> Self {
        Self {
            kernel: Mutex::new(Kernel::new(platform)),
        }
    }

    /// Reserves `size` bytes from the OS and makes them one free block.
    /// `size` is rounded up to a multiple of [`ALIGNMENT`] first, so
    /// `init(1001)` manages 1008 bytes.
    ///
    /// Calling this again without [`MemAlloc::cleanup`] leaks the previous
    /// heap and invalidates every pointer handed out from it.
    ///
    /// # Errors
    ///
    /// - [`AllocatorError::RegionTooSmall`] if `size` can't hold a header and a word.
    /// - [`AllocatorError::OsReservationFailed`] if the OS refuses the memory.
    pub fn init(&self, size: usize) -> Result<()> {
        self.kernel.lock().init(size)
    }

    /// Forgets the heap. The memory stays mapped in the process.
    pub fn cleanup(&self) {
        self.kernel.lock().cleanup();
    }

    /// Returns a pointer to at least `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// `None` when `size` is zero, when the heap isn't initialized, or when it
    /// needs to grow and the OS refuses.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.kernel.lock().allocate(size)
    }

    /// Gives the block at `ptr` back to the heap. Null is a no-op.
    ///
    /// Pointers that are not a block of this heap are ignored and logged. A
    /// repeated free is ignored too, but only while the block is still free:
    /// once the address has been handed out again, freeing it a second time
    /// releases the new owner's block.
    ///
    /// # Safety
    ///
    /// - `ptr` must not have been freed already.
    /// - The content of the block must not be used after this call.
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { self.kernel.lock().free(ptr) }
    }

    /// Resizes the block at `ptr` to at least `new_size` bytes.
    ///
    /// - Null `ptr` behaves like [`MemAlloc::allocate`].
    /// - Zero `new_size` behaves like [`MemAlloc::free`] and returns `None`.
    /// - If the block already holds `new_size` bytes the same pointer comes back.
    /// - Otherwise the content moves to a new block and the old one is freed.
    ///   If that allocation fails, `None` is returned and `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this heap that has not been
    /// freed already. When a different pointer is returned, `ptr` must not be
    /// used anymore.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        unsafe { self.kernel.lock().reallocate(ptr, new_size) }
    }

    /// Number of usable bytes in the block at `ptr`, which may be more than
    /// requested. Zero for null, freed or unknown pointers.
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        self.kernel.lock().usable_size(ptr)
    }

    /// Snapshot of the block ledger.
    pub fn stats(&self) -> HeapStats {
        self.kernel.lock().stats()
    }

    pub fn is_initialized(&self) -> bool {
        self.kernel.lock().is_initialized()
    }
}
