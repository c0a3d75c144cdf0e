//! # lmem-core
//!
//! Safe core of the lmem allocator: a first-fit, address-ordered block list
//! layered over a growable break segment, with a dedicated-mapping path for
//! large requests.
//!
//! The allocator never touches raw memory itself. Every interaction with the
//! break boundary, anonymous mappings, block headers and payload bytes goes
//! through the capability traits in [`malloc::system`], so the same state
//! machine runs over the real process (see `lmem-abi`) or over
//! [`malloc::SimulatedMemory`] in tests. No `unsafe` code is permitted at the
//! crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod malloc;
pub mod mmap;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod syscall;
