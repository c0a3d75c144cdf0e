#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::ffi::c_void;

use lmem::malloc_abi::{calloc, free, malloc, realloc};
use lmem::system::LinuxSystem;
use lmem_core::config::{AllocatorConfig, CheckMode};
use lmem_core::malloc::{AllocPath, MMAP_THRESHOLD, MallocState};

unsafe fn fill(ptr: *mut c_void, byte: u8, len: usize) {
    unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), byte, len) };
}

unsafe fn all_eq(ptr: *const c_void, byte: u8, len: usize) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }
        .iter()
        .all(|&b| b == byte)
}

#[test]
fn malloc_free_small_and_large() {
    for len in [1usize, 24, 100, 4096, MMAP_THRESHOLD - 1, MMAP_THRESHOLD, 3 * MMAP_THRESHOLD] {
        // SAFETY: each block is written within bounds and freed once.
        unsafe {
            let ptr = malloc(len);
            assert!(!ptr.is_null(), "malloc({len}) failed");
            fill(ptr, 0xAB, len);
            assert!(all_eq(ptr, 0xAB, len));
            free(ptr);
        }
    }
}

#[test]
fn free_null_is_a_noop() {
    // SAFETY: null is always accepted.
    unsafe { free(std::ptr::null_mut()) };
}

#[test]
fn calloc_returns_zeroed_memory_after_reuse() {
    // SAFETY: blocks are used within bounds and freed once.
    unsafe {
        let dirty = malloc(512);
        fill(dirty, 0x5A, 512);
        free(dirty);
        let ptr = calloc(64, 8);
        assert!(!ptr.is_null());
        assert!(all_eq(ptr, 0, 512));
        free(ptr);

        let big = calloc(4, MMAP_THRESHOLD);
        assert!(!big.is_null());
        assert!(all_eq(big, 0, 4 * MMAP_THRESHOLD));
        free(big);
    }
}

#[test]
fn realloc_keeps_contents_across_both_paths() {
    // SAFETY: every access stays inside the current block size.
    unsafe {
        let mut ptr = realloc(std::ptr::null_mut(), 40);
        assert!(!ptr.is_null(), "realloc(NULL, n) behaves as malloc");
        fill(ptr, 0x11, 40);

        for len in [400usize, 5000, MMAP_THRESHOLD + 10, 4 * MMAP_THRESHOLD] {
            ptr = realloc(ptr, len);
            assert!(!ptr.is_null(), "realloc to {len} failed");
            assert!(all_eq(ptr, 0x11, 40), "prefix lost growing to {len}");
        }
        ptr = realloc(ptr, 20);
        assert!(all_eq(ptr, 0x11, 20));
        free(ptr);
    }
}

#[test]
fn concurrent_threads_share_the_heap() {
    let workers: Vec<_> = (0..4u8)
        .map(|tag| {
            std::thread::spawn(move || {
                for round in 0..200usize {
                    let len = 16 + (round * 37) % 3000;
                    // SAFETY: block is private to this thread and freed once.
                    unsafe {
                        let ptr = malloc(len);
                        assert!(!ptr.is_null());
                        fill(ptr, tag, len);
                        std::thread::yield_now();
                        assert!(all_eq(ptr, tag, len), "another thread wrote into our block");
                        free(ptr);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn private_state_over_real_memory_keeps_heap_well_formed() {
    let system = LinuxSystem::with_reserved_heap(64 << 20).unwrap();
    let mut state = MallocState::with_config(
        system,
        AllocatorConfig::new()
            .with_mode(CheckMode::Checked)
            .with_mmap(true),
    );

    let mut live = Vec::new();
    for i in 0..200usize {
        let len = (i * 977) % (MMAP_THRESHOLD + 8192);
        let ptr = state.malloc(len).unwrap();
        let expected = if len >= MMAP_THRESHOLD {
            AllocPath::Mapped
        } else {
            AllocPath::Heap
        };
        assert_eq!(state.path_of(ptr), Some(expected));
        live.push(ptr);
        if i % 3 == 0 {
            let victim = live.swap_remove(i % live.len());
            state.free(victim);
        }
        state.audit().unwrap();
    }
    for ptr in live {
        state.free(ptr);
    }
    let summary = state.audit().unwrap();
    assert_eq!(summary.blocks, summary.free_blocks);
    assert!(summary.blocks <= 1, "fully released heap coalesces to one block");
}
