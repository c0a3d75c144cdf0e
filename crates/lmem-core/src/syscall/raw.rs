//! Raw x86_64 Linux syscall primitives.
//!
//! Only the arities the allocator issues are provided: `brk` takes one
//! argument, `munmap` two, `mremap` five and `mmap` six.
//!
//! ```text
//! syscall number → rax
//! arg1..arg6     → rdi, rsi, rdx, r10, r8, r9
//! return         → rax
//! clobbered      → rcx, r11
//! ```

use core::arch::asm;

/// Trap into the kernel with one argument.
///
/// # Safety
///
/// `nr` and the arguments must form a request whose side effects the
/// caller is prepared for.
#[inline]
pub unsafe fn syscall1(nr: usize, a1: usize) -> usize {
    let ret: usize;
    // SAFETY: the kernel preserves every register except rax, rcx and r11.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Trap into the kernel with two arguments.
///
/// # Safety
///
/// `nr` and the arguments must form a request whose side effects the
/// caller is prepared for.
#[inline]
pub unsafe fn syscall2(nr: usize, a1: usize, a2: usize) -> usize {
    let ret: usize;
    // SAFETY: the kernel preserves every register except rax, rcx and r11.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Trap into the kernel with five arguments.
///
/// # Safety
///
/// `nr` and the arguments must form a request whose side effects the
/// caller is prepared for.
#[inline]
pub unsafe fn syscall5(nr: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize) -> usize {
    let ret: usize;
    // SAFETY: the kernel preserves every register except rax, rcx and r11.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Trap into the kernel with six arguments.
///
/// # Safety
///
/// `nr` and the arguments must form a request whose side effects the
/// caller is prepared for.
#[inline]
pub unsafe fn syscall6(
    nr: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret: usize;
    // SAFETY: the kernel preserves every register except rax, rcx and r11.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            in("r9") a6,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}
