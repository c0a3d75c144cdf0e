//! Raw Linux x86_64 syscall veneer for the allocator's OS collaborators.
//!
//! lmem replaces the process allocator, so it cannot route its own memory
//! requests back through `libc`. The four syscalls the allocator depends on
//! (`brk`, `mmap`, `munmap`, `mremap`) are issued directly with inline
//! assembly and decoded into typed results here.
//!
//! # Safety
//!
//! Each wrapper is `unsafe` because the kernel trusts the caller to supply
//! valid arguments. Moving the break or unmapping a region can invalidate
//! memory that live references still point into.

#[allow(unsafe_code)]
mod raw;

pub use raw::*;

use crate::mmap::{ALLOC_FLAGS, ALLOC_PROT, MREMAP_MAYMOVE, RESERVE_FLAGS};

// -------------------------------------------------------------------------
// Syscall number constants (x86_64 Linux)
// -------------------------------------------------------------------------

pub const SYS_MMAP: usize = 9;
pub const SYS_MUNMAP: usize = 11;
pub const SYS_BRK: usize = 12;
pub const SYS_MREMAP: usize = 25;

// -------------------------------------------------------------------------
// Error handling
// -------------------------------------------------------------------------

/// Maximum errno value returned by Linux syscalls.
const MAX_ERRNO: usize = 4095;

/// Convert a raw syscall return value to `Result<usize, i32>`.
///
/// Error returns are in the range `[-(MAX_ERRNO), -1]`, which in unsigned
/// representation is `[usize::MAX - MAX_ERRNO + 1, usize::MAX]`.
#[inline]
pub fn syscall_result(ret: usize) -> Result<usize, i32> {
    if ret > usize::MAX - MAX_ERRNO {
        Err(-(ret as isize) as i32)
    } else {
        Ok(ret)
    }
}

// -------------------------------------------------------------------------
// Typed syscall wrappers
// -------------------------------------------------------------------------

/// `brk(addr)`: set the end of the data segment.
///
/// The kernel returns the resulting break: the requested address on success,
/// the unchanged break on failure. `sys_brk(0)` therefore queries the current
/// boundary without moving it.
///
/// # Safety
///
/// Lowering the break releases memory that may still be referenced.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_brk(addr: usize) -> usize {
    // SAFETY: caller accepts the consequences of moving the break.
    unsafe { raw::syscall1(SYS_BRK, addr) }
}

/// `mmap(NULL, length, PROT_READ|PROT_WRITE, MAP_PRIVATE|MAP_ANONYMOUS, -1, 0)`.
///
/// Returns the base of a fresh zero-filled mapping.
#[inline]
pub fn sys_mmap_anonymous(length: usize) -> Result<usize, i32> {
    mmap_anonymous_with(length, ALLOC_FLAGS)
}

/// Like [`sys_mmap_anonymous`], with `MAP_NORESERVE`: pages are committed on
/// first touch, so most of the range can stay untouched.
#[inline]
pub fn sys_mmap_reserve(length: usize) -> Result<usize, i32> {
    mmap_anonymous_with(length, RESERVE_FLAGS)
}

#[allow(unsafe_code)]
fn mmap_anonymous_with(length: usize, flags: i32) -> Result<usize, i32> {
    // SAFETY: a private anonymous mapping at a kernel-chosen address cannot
    // alias any existing memory.
    let ret = unsafe {
        raw::syscall6(
            SYS_MMAP,
            0,
            length,
            ALLOC_PROT as usize,
            flags as usize,
            -1i32 as usize,
            0,
        )
    };
    syscall_result(ret)
}

/// `munmap(addr, length)`: unmap memory.
///
/// # Safety
///
/// `addr` must be page-aligned and nothing may reference
/// `[addr, addr+length)` afterwards.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_munmap(addr: usize, length: usize) -> Result<(), i32> {
    // SAFETY: caller guarantees addr/length validity.
    let ret = unsafe { raw::syscall2(SYS_MUNMAP, addr, length) };
    syscall_result(ret).map(|_| ())
}

/// `mremap(addr, old_length, new_length, MREMAP_MAYMOVE)`: resize a mapping,
/// relocating it if it cannot grow in place.
///
/// # Safety
///
/// `[addr, addr+old_length)` must be an existing mapping. On success the old
/// range must no longer be referenced if the returned base differs.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mremap(addr: usize, old_length: usize, new_length: usize) -> Result<usize, i32> {
    // SAFETY: caller guarantees the source mapping is valid.
    let ret = unsafe {
        raw::syscall5(
            SYS_MREMAP,
            addr,
            old_length,
            new_length,
            MREMAP_MAYMOVE as usize,
            0,
        )
    };
    syscall_result(ret)
}

// -------------------------------------------------------------------------
// Unit tests
// -------------------------------------------------------------------------

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn brk_query_is_stable() {
        // SAFETY: a zero argument never moves the break.
        let a = unsafe { sys_brk(0) };
        let b = unsafe { sys_brk(0) };
        assert!(a > 0, "break boundary should be a real address");
        assert!(b >= a, "break boundary must not move backwards");
    }

    #[test]
    fn mmap_anonymous_is_zeroed_and_writable() {
        let base = sys_mmap_anonymous(PAGE).expect("mmap should succeed");
        assert_eq!(base % PAGE, 0, "mapping must be page aligned");

        // SAFETY: we just mapped this page read/write.
        unsafe {
            let ptr = base as *mut u8;
            assert_eq!(*ptr, 0, "anonymous mapping must start zeroed");
            *ptr = 42;
            assert_eq!(*ptr, 42);
            assert!(sys_munmap(base, PAGE).is_ok());
        }
    }

    #[test]
    fn reservation_is_lazily_committed() {
        let span = 1 << 30;
        let base = sys_mmap_reserve(span).expect("reservation should succeed");
        // SAFETY: the reservation is read/write; only two pages get touched.
        unsafe {
            (base as *mut u8).add(span - 1).write(7);
            assert_eq!((base as *const u8).add(PAGE).read(), 0);
            assert!(sys_munmap(base, span).is_ok());
        }
    }

    #[test]
    fn mremap_grows_and_preserves_contents() {
        let base = sys_mmap_anonymous(PAGE).expect("mmap should succeed");
        // SAFETY: the mapping is live and read/write for the whole test.
        unsafe {
            (base as *mut u8).write(0x5A);
            let moved = sys_mremap(base, PAGE, 4 * PAGE).expect("mremap should succeed");
            assert_eq!((moved as *const u8).read(), 0x5A, "contents survive remap");
            (moved as *mut u8).add(3 * PAGE).write(1);
            assert!(sys_munmap(moved, 4 * PAGE).is_ok());
        }
    }

    #[test]
    fn munmap_unaligned_is_einval() {
        // SAFETY: an unaligned address is rejected before anything is unmapped.
        let result = unsafe { sys_munmap(1, PAGE) };
        assert_eq!(result, Err(22), "unaligned munmap should return EINVAL");
    }

    #[test]
    fn syscall_result_decodes_errno_range() {
        assert_eq!(syscall_result(0), Ok(0));
        assert_eq!(syscall_result(usize::MAX - 4096), Ok(usize::MAX - 4096));
        assert_eq!(syscall_result(usize::MAX), Err(1));
        assert_eq!(syscall_result((-12isize) as usize), Err(12));
    }
}
