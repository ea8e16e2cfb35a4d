//! The only thing the allocator needs from the OS: a contiguous span of
//! memory whose end (the "break") can be pushed forward.
//!
//! ```text
//!   base                                    break          end of reservation
//!    |                                        |                     |
//!    v                                        v                     v
//!    +----------------------------------------+---------------------+
//!    |            managed heap                |    not yet handed   |
//!    +----------------------------------------+---------------------+
//!                                              ---- extend(len) -->
//! ```

use std::ptr::NonNull;

use log::{debug, warn};

use crate::utils::align;

/// Address space reserved by [`VirtualMemory::new`]. Only the pages the heap
/// actually reaches are committed.
pub const DEFAULT_RESERVATION: usize = 1 << 30;

/// This trait abstracts the low level memory primitive behind the heap. As
/// the allocator, our top level view of this has nothing to do with the
/// concrete APIs offered by each kernel.
pub trait PlatformMemory: Send {
    /// Obtains a fresh contiguous span of `len` bytes and moves the break to
    /// its end. Returns the first byte of the span or `None` if the OS says no.
    ///
    /// # Safety
    ///
    /// Calls must be serialized. A second call abandons whatever the first
    /// one returned.
    unsafe fn reserve(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Pushes the break forward by `len` bytes and returns the previous
    /// break, which is the first byte of the new span.
    ///
    /// The returned span is only guaranteed to follow the previous one when
    /// nothing else moves the break; callers have to check.
    ///
    /// # Safety
    ///
    /// Calls must be serialized with every other call on this source.
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// The classic program break, moved with `sbrk(2)`.
///
/// `sbrk` is process wide and not thread safe. Anything else in the process
/// moving the break (the system allocator included) can make growth
/// non-contiguous, in which case the heap reports itself exhausted, and two
/// heaps over the same break would be handed overlapping memory.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct ProgramBreak {
    _private: (),
}

#[cfg(target_os = "linux")]
impl ProgramBreak {
    /// # Safety
    ///
    /// For as long as the heap built on it is in use, nothing else may move
    /// the program break while the heap does (no other `ProgramBreak`, and
    /// no `brk`/`sbrk` from other threads, the system allocator included),
    /// and nothing may shrink the break below the end of the heap.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    unsafe fn sbrk(len: usize) -> Option<NonNull<u8>> {
        let increment = libc::intptr_t::try_from(len).ok()?;

        unsafe {
            let addr = libc::sbrk(increment);

            if addr == usize::MAX as *mut libc::c_void {
                return None;
            }

            NonNull::new(addr.cast::<u8>())
        }
    }
}

#[cfg(target_os = "linux")]
impl PlatformMemory for ProgramBreak {
    unsafe fn reserve(&mut self, len: usize) -> Option<NonNull<u8>> {
        unsafe { Self::sbrk(len) }
    }

    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        unsafe { Self::sbrk(len) }
    }
}

/// A private break: a large range of address space is reserved up front with
/// no access rights, and pages are committed as the break walks over them.
///
/// Growth is always contiguous and never races with other allocators in the
/// process. Extending past `capacity` fails, which is also how tests turn
/// heap growth off.
#[derive(Debug)]
pub struct VirtualMemory {
    /// Upper bound of bytes the break may reach.
    capacity: usize,
    /// Start of the current reservation.
    base: Option<NonNull<u8>>,
    /// `capacity` rounded to pages, as reserved from the OS.
    reserved: usize,
    /// Bytes already made readable and writable.
    committed: usize,
    /// Offset of the break from `base`.
    brk: usize,
    page_size: usize,
}

// SAFETY: the reservation is owned exclusively by this value.
unsafe impl Send for VirtualMemory {}

/// Per-OS primitives [`VirtualMemory`] is built from.
trait AddressSpace {
    /// Reserves `len` bytes of inaccessible address space.
    unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` bytes at `addr` readable and writable.
    unsafe fn commit_range(addr: NonNull<u8>, len: usize) -> bool;

    /// Gives a whole reservation back to the OS.
    unsafe fn release_range(addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes.
    fn page_size() -> usize;
}

impl VirtualMemory {
    pub const fn new() -> Self {
        Self::with_capacity(DEFAULT_RESERVATION)
    }

    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            base: None,
            reserved: 0,
            committed: 0,
            brk: 0,
            page_size: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Commits every page up to `offset` bytes past `base`.
    unsafe fn commit_up_to(&mut self, base: NonNull<u8>, offset: usize) -> bool {
        let needed = align(offset, self.page_size);

        if needed <= self.committed {
            return true;
        }

        unsafe {
            let start = base.add(self.committed);

            if !Self::commit_range(start, needed - self.committed) {
                warn!("failed to commit {} bytes at {:p}", needed - self.committed, start);
                return false;
            }
        }

        self.committed = needed;
        true
    }
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformMemory for VirtualMemory {
    unsafe fn reserve(&mut self, len: usize) -> Option<NonNull<u8>> {
        if len > self.capacity {
            return None;
        }

        if let Some(previous) = self.base.take() {
            debug!("abandoning previous reservation of {} bytes at {:p}", self.reserved, previous);
        }

        self.page_size = Self::page_size();
        let reserved = self.capacity.checked_next_multiple_of(self.page_size)?;

        unsafe {
            let base = Self::reserve_range(reserved)?;

            self.base = Some(base);
            self.reserved = reserved;
            self.committed = 0;
            self.brk = 0;

            if !self.commit_up_to(base, len) {
                return None;
            }

            self.brk = len;
            Some(base)
        }
    }

    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        let base = self.base?;
        let new_brk = self.brk.checked_add(len).filter(|brk| *brk <= self.capacity)?;

        unsafe {
            if !self.commit_up_to(base, new_brk) {
                return None;
            }

            let previous = base.add(self.brk);
            self.brk = new_brk;

            Some(previous)
        }
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { Self::release_range(base, self.reserved) }
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{AddressSpace, VirtualMemory};

    use libc::{MAP_FAILED, mmap, mprotect, munmap, off_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl AddressSpace for VirtualMemory {
        unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // No access until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len, PROT, FLAGS, FD, OFFSET);

                if addr == MAP_FAILED {
                    return None;
                }

                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn commit_range(addr: NonNull<u8>, len: usize) -> bool {
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr.as_ptr().cast::<c_void>(), len, PROT) == 0 }
        }

        unsafe fn release_range(addr: NonNull<u8>, len: usize) {
            unsafe {
                munmap(addr.as_ptr().cast::<c_void>(), len);
            }
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{AddressSpace, VirtualMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl AddressSpace for VirtualMemory {
        unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr =
                    Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_range(addr: NonNull<u8>, len: usize) -> bool {
            unsafe {
                let committed = Memory::VirtualAlloc(
                    Some(addr.as_ptr().cast_const().cast::<c_void>()),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !committed.is_null()
            }
        }

        unsafe fn release_range(addr: NonNull<u8>, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }

        fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_memory_extends_contiguously() {
        let mut memory = VirtualMemory::with_capacity(1 << 20);

        unsafe {
            let base = memory.reserve(1000).unwrap();
            let next = memory.extend(24).unwrap();
            let after = memory.extend(5000).unwrap();

            assert_eq!(next.as_ptr(), base.as_ptr().add(1000));
            assert_eq!(after.as_ptr(), base.as_ptr().add(1024));

            // Every byte up to the break is writable.
            after.as_ptr().write_bytes(0xAB, 5000);
            assert_eq!(*after.as_ptr().add(4999), 0xAB);
        }
    }

    #[test]
    fn virtual_memory_respects_capacity() {
        let mut memory = VirtualMemory::with_capacity(4096);

        unsafe {
            assert!(memory.reserve(8192).is_none());
            assert!(memory.reserve(4000).is_some());
            assert!(memory.extend(96).is_some());
            assert!(memory.extend(1).is_none());
        }
    }

    #[test]
    fn extend_before_reserve_fails() {
        let mut memory = VirtualMemory::new();

        unsafe {
            assert!(memory.extend(64).is_none());
        }
    }
}
