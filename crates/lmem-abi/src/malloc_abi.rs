//! ABI layer for memory allocation functions (`malloc`, `free`, `calloc`, `realloc`).
//!
//! One process-wide [`MallocState`] sits behind a `parking_lot` mutex; the
//! mutex is the only thing that makes the heap list safe to share between
//! threads. Mapped blocks are self-describing, so releasing or resizing one
//! never takes the lock.
//!
//! A call that re-enters the allocator on the same thread (lock contention
//! parking, the first read of the environment) cannot take the lock again.
//! It is served from a dedicated mapping instead, which the non-reentrant
//! paths later recognize from the header alone.
//!
//! Debug builds do not export the symbols, so test binaries keep the host
//! allocator (see [`crate::system::ProcessBreak`]).

use std::cell::Cell;
use std::ffi::{c_int, c_void};

use lmem_core::config::process_config;
use lmem_core::malloc::large;
use lmem_core::malloc::{
    AllocError, BlockHeader, BlockMemory, MallocState, header_of, payload_of, units_to_bytes,
};
use parking_lot::Mutex;

use crate::system::{LinuxSystem, ProcessPages, process_system};

static ALLOCATOR: Mutex<Option<MallocState<LinuxSystem>>> = parking_lot::const_mutex(None);

thread_local! {
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct AllocatorReentryGuard;

impl Drop for AllocatorReentryGuard {
    fn drop(&mut self) {
        ALLOCATOR_REENTRY_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

#[inline]
fn enter_allocator_reentry_guard() -> Option<AllocatorReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH.with(|depth| {
        let current = depth.get();
        if current > 0 {
            None
        } else {
            depth.set(current + 1);
            Some(AllocatorReentryGuard)
        }
    })
}

#[inline]
unsafe fn set_abi_errno(val: c_int) {
    // SAFETY: libc returns the calling thread's errno slot.
    unsafe { *libc::__errno_location() = val };
}

#[inline]
fn pages() -> ProcessPages {
    // SAFETY: every address these entrypoints pass on is either a mapping
    // they just created or a pointer the C caller obtained from them.
    unsafe { ProcessPages::new() }
}

fn finish(result: Result<usize, AllocError>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            // SAFETY: plain thread-local store.
            unsafe { set_abi_errno(err.errno()) };
            std::ptr::null_mut()
        }
    }
}

fn with_state(
    op: impl FnOnce(&mut MallocState<LinuxSystem>) -> Result<usize, AllocError>,
) -> Result<usize, AllocError> {
    let mut guard = ALLOCATOR.lock();
    let state = match &mut *guard {
        Some(state) => state,
        empty => {
            let system = process_system()
                .map_err(|source| AllocError::HeapExhausted { units: 0, source })?;
            empty.insert(MallocState::with_config(system, process_config()))
        }
    };
    op(state)
}

fn reentrant_map(len: usize) -> Result<usize, AllocError> {
    large::map_block(&mut pages(), len, process_config().mode).map(payload_of)
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// Returns null with `errno = ENOMEM` on failure.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        return finish(reentrant_map(size));
    };
    finish(with_state(|state| state.malloc(size)))
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// `free` -- returns memory obtained from `malloc`, `calloc` or `realloc`.
///
/// Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator, released at
/// most once. Nothing is validated.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let addr = ptr as usize;
    let header = header_of(addr);
    let mut pages = pages();
    if let Some(block) = pages.mapped_block(header) {
        // munmap failure leaves the mapping in place; there is nobody to tell.
        let _ = large::unmap_block(&mut pages, header, block);
        return;
    }

    // A heap block freed from inside the allocator stays allocated: taking
    // the lock here would deadlock.
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        return;
    };
    let _ = with_state(|state| {
        state.free(addr);
        Ok(0)
    });
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// `calloc` -- allocates `nmemb * size` zero-filled bytes.
///
/// # Safety
///
/// Same as [`malloc`].
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        let total = if process_config().mode.checks_overflow() {
            match nmemb.checked_mul(size) {
                Some(total) => total,
                None => {
                    return finish(Err(AllocError::SizeOverflow {
                        what: "calloc size",
                    }));
                }
            }
        } else {
            nmemb.wrapping_mul(size)
        };
        // Fresh anonymous mappings are already zero.
        return finish(reentrant_map(total));
    };
    finish(with_state(|state| state.calloc(nmemb, size)))
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// `realloc` -- resizes the block at `ptr` to `size` bytes, moving it if
/// needed. Null behaves as `malloc(size)`.
///
/// On failure returns null, sets `errno`, and leaves the old block intact.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator. After success
/// only the returned pointer may be used.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        // SAFETY: forwarding the caller's contract.
        return unsafe { malloc(size) };
    }
    let addr = ptr as usize;
    let header = header_of(addr);
    let mut pages = pages();
    if let Some(block) = pages.mapped_block(header) {
        return finish(
            large::remap_block(&mut pages, header, block, size, process_config().mode)
                .map(payload_of),
        );
    }

    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // Move the heap block into a mapping without touching the list. The
        // old block stays allocated, as in `free`.
        let BlockHeader::Heap(old) = pages.load(header) else {
            return std::ptr::null_mut();
        };
        let copy_len = size.min(units_to_bytes(old.units.saturating_sub(1)));
        return finish(reentrant_map(size).map(|new_ptr| {
            pages.copy(addr, new_ptr, copy_len);
            new_ptr
        }));
    };
    finish(with_state(|state| state.realloc(addr, size)))
}
