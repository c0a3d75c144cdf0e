// All extern "C" ABI exports accept raw pointers from C callers and validate
// nothing, exactly like the C functions they replace.
#![allow(clippy::missing_safety_doc)]
//! # lmem-abi
//!
//! Drop-in `extern "C"` allocator boundary for lmem.
//!
//! Builds a `cdylib` (`liblmem.so`) exporting `malloc`, `free`, `calloc` and
//! `realloc`, each delegating to the safe allocator in `lmem-core` running on
//! the real break boundary and anonymous mappings of the process.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> MallocState<LinuxSystem> -> brk / mmap
//! ```
//!
//! x86_64 Linux only: the syscalls are issued directly, never through libc's
//! own allocator.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod malloc_abi;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod system;
