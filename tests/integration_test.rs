//! Integration tests for the heapmalloc allocator

use std::{ptr, sync::Arc, thread};

use heapmalloc::{ALIGNMENT, AllocatorError, BLOCK_HEADER_SIZE, MemAlloc, VirtualMemory};

fn heap(size: usize) -> MemAlloc {
    let heap = MemAlloc::new();
    heap.init(size).unwrap();
    heap
}

#[test]
fn test_basic_allocation_flow() {
    let heap = heap(1024);

    let a = heap.allocate(128).unwrap();
    let b = heap.allocate(64).unwrap();
    let c = heap.allocate(32).unwrap();

    unsafe { heap.free(a.as_ptr()) };

    // The freed block is the first fit for the same size.
    let d = heap.allocate(128).unwrap();
    assert_eq!(a, d);

    unsafe {
        heap.free(b.as_ptr());
        heap.free(c.as_ptr());
        heap.free(d.as_ptr());
    }

    let stats = heap.stats();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.free_bytes, 1024 - BLOCK_HEADER_SIZE);

    heap.cleanup();
    assert!(!heap.is_initialized());
}

#[test]
fn test_live_regions_never_overlap() {
    let heap = heap(4096);
    let sizes = [1, 7, 8, 9, 24, 100, 333, 512, 1000, 2048, 5000];

    let mut regions = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let ptr = heap.allocate(size).unwrap();
        let usable = heap.usable_size(ptr.as_ptr());

        assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        assert!(usable >= size.next_multiple_of(ALIGNMENT));

        unsafe { ptr.as_ptr().write_bytes(i as u8, usable) };
        regions.push((ptr.as_ptr() as usize, usable, i as u8));
    }

    regions.sort();
    for pair in regions.windows(2) {
        let (start, len, _) = pair[0];
        let (next, _, _) = pair[1];
        assert!(start + len <= next);
    }

    // Nobody scribbled over anybody else.
    for &(start, len, byte) in &regions {
        let content = unsafe { std::slice::from_raw_parts(start as *const u8, len) };
        assert!(content.iter().all(|b| *b == byte));
    }
}

#[test]
fn test_zero_size_consumes_nothing() {
    let heap = heap(1024);
    let before = heap.stats();

    assert!(heap.allocate(0).is_none());
    assert_eq!(heap.stats(), before);
}

#[test]
fn test_repeated_free_before_reuse_is_ignored() {
    let heap = heap(1024);

    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();

    unsafe {
        heap.free(a.as_ptr());
        heap.free(a.as_ptr());
        heap.free(ptr::null_mut());
    }

    // One hole at `a`, one free tail.
    assert_eq!(heap.stats().free_blocks, 2);
    assert_eq!(heap.allocate(64), Some(a));
}

#[test]
fn test_coalescing_serves_combined_request() {
    let heap = heap(1024);

    let a = heap.allocate(128).unwrap();
    let b = heap.allocate(128).unwrap();
    let _c = heap.allocate(128).unwrap();

    unsafe {
        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
    }

    let combined = heap.allocate(256).unwrap();
    assert_eq!(combined, a);
    assert_eq!(heap.usable_size(combined.as_ptr()), 128 + BLOCK_HEADER_SIZE + 128);
}

#[test]
fn test_split_remainder_is_reusable() {
    let heap = heap(4096);

    let large = heap.allocate(2048).unwrap();
    let _guard = heap.allocate(16).unwrap();
    unsafe { heap.free(large.as_ptr()) };

    let small = heap.allocate(100).unwrap();
    assert_eq!(small, large);

    let remainder = 2048 - 104 - BLOCK_HEADER_SIZE;
    let rest = heap.allocate(remainder).unwrap();

    assert_eq!(rest.as_ptr() as usize, small.as_ptr() as usize + 104 + BLOCK_HEADER_SIZE);
    assert_eq!(heap.usable_size(rest.as_ptr()), remainder);
}

#[test]
fn test_reallocate_preserves_content() {
    let heap = heap(1024);
    const N: usize = 200;

    let a = heap.allocate(N).unwrap();
    let _guard = heap.allocate(8).unwrap();

    unsafe {
        for i in 0..N {
            *a.as_ptr().add(i) = (i % 251) as u8;
        }

        let b = heap.reallocate(a.as_ptr(), 2 * N).unwrap();

        for i in 0..N {
            assert_eq!(*b.as_ptr().add(i), (i % 251) as u8);
        }
    }
}

#[test]
fn test_reallocate_shrink_keeps_pointer() {
    let heap = heap(1024);

    let a = heap.allocate(100).unwrap();

    unsafe {
        assert_eq!(heap.reallocate(a.as_ptr(), 100), Some(a));
        assert_eq!(heap.reallocate(a.as_ptr(), 1), Some(a));
    }
}

#[test]
fn test_whole_heap_request_then_growth() {
    let heap = heap(1024);
    let whole = 1024 - BLOCK_HEADER_SIZE;

    let first = heap.allocate(whole).unwrap();
    let second = heap.allocate(whole).unwrap();

    assert_ne!(first, second);
    assert!(second.as_ptr() as usize >= first.as_ptr() as usize + whole);
    assert!(heap.stats().heap_size > 1024);
}

#[test]
fn test_whole_heap_request_without_growth() {
    let heap = MemAlloc::with_platform(VirtualMemory::with_capacity(1024));
    heap.init(1024).unwrap();
    let whole = 1024 - BLOCK_HEADER_SIZE;

    assert!(heap.allocate(whole).is_some());
    assert!(heap.allocate(whole).is_none());
}

#[test]
fn test_init_errors() {
    let heap = MemAlloc::with_platform(VirtualMemory::with_capacity(4096));

    assert_eq!(heap.init(8), Err(AllocatorError::RegionTooSmall { size: 8 }));
    assert_eq!(
        heap.init(1 << 20),
        Err(AllocatorError::OsReservationFailed { size: 1 << 20 })
    );
    assert!(!heap.is_initialized());
    assert!(heap.allocate(8).is_none());
}

#[test]
fn test_init_rounds_size_to_word() {
    let heap = heap(1001);

    assert_eq!(heap.stats().heap_size, 1008);
    assert!(heap.allocate(1008 - BLOCK_HEADER_SIZE).is_some());
}

#[test]
fn test_concurrent_allocations() {
    let heap = Arc::new(heap(64 * 1024));

    let handles: Vec<_> = (0..8u8)
        .map(|id| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                for round in 0..200usize {
                    let size = 8 + (round * 13 + id as usize * 7) % 256;
                    let ptr = heap.allocate(size).unwrap();

                    unsafe {
                        ptr.as_ptr().write_bytes(id, size);
                        let written = std::slice::from_raw_parts(ptr.as_ptr(), size);
                        assert!(written.iter().all(|b| *b == id));

                        let ptr = heap.reallocate(ptr.as_ptr(), size * 2).unwrap();
                        assert_eq!(*ptr.as_ptr(), id);
                        heap.free(ptr.as_ptr());
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = heap.stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.blocks, 1);
}
