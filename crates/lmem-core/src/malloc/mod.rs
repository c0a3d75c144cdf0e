//! Memory allocation.
//!
//! Implements the malloc family with a two-tier design:
//! - Requests below [`MMAP_THRESHOLD`]: first-fit over an address-ordered,
//!   intrusive list of blocks carved out of the break segment, with block
//!   splitting and coalescing of adjacent free blocks on release.
//! - Requests at or above the threshold: one dedicated anonymous mapping per
//!   block, returned to the OS on free and resized with may-move remapping.

pub mod allocator;
pub mod block;
pub mod error;
pub mod heap;
pub mod large;
pub mod sim;
pub mod system;

pub use allocator::{AllocPath, AllocatorLogLevel, AllocatorLogRecord, MallocState};
pub use block::{
    BlockHeader, HEADER_SIZE, HeapBlock, MAPPED_SENTINEL, MMAP_THRESHOLD, MappedBlock, PAGE_SIZE,
    header_of, payload_of, units_to_bytes,
};
pub use error::AllocError;
pub use heap::{Coalesce, HeapAuditError, HeapList, HeapSummary, Placement};
pub use sim::{SimulatedMemory, SysCall};
pub use system::{BlockMemory, BreakBoundary, PageMapper, SysError, SystemMemory};
