//! Capabilities the allocator needs from its environment.
//!
//! The core never dereferences an address. It asks a [`BreakBoundary`] to
//! move the end of the heap segment, a [`PageMapper`] for dedicated
//! mappings, and a [`BlockMemory`] to persist headers and move payload bytes.
//! `lmem-abi` implements all three over the running process;
//! [`super::SimulatedMemory`] implements them over owned buffers.

use thiserror::Error;

/// Failure reported by an OS collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SysError {
    #[error("break boundary could not be extended (errno {errno})")]
    BreakExhausted { errno: i32 },
    #[error("anonymous mapping failed (errno {errno})")]
    MapFailed { errno: i32 },
    #[error("unmapping failed (errno {errno})")]
    UnmapFailed { errno: i32 },
    #[error("remapping failed (errno {errno})")]
    RemapFailed { errno: i32 },
}

impl SysError {
    /// The errno carried by the failure.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::BreakExhausted { errno }
            | Self::MapFailed { errno }
            | Self::UnmapFailed { errno }
            | Self::RemapFailed { errno } => errno,
        }
    }
}

/// The upper boundary of the process heap segment.
///
/// The allocator assumes nothing else moves the boundary, and never lowers it.
pub trait BreakBoundary {
    /// Current boundary, without moving it.
    fn query(&mut self) -> usize;

    /// Move the boundary up to `new_break`. Returns the previous boundary.
    fn extend(&mut self, new_break: usize) -> Result<usize, SysError>;
}

/// Anonymous, zero-initialized, read/write mappings.
pub trait PageMapper {
    /// Map `len` bytes (page aligned) and return the base address.
    fn map(&mut self, len: usize) -> Result<usize, SysError>;

    /// Unmap a region previously returned by `map` or `remap`.
    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), SysError>;

    /// Resize a mapping, relocating it if needed. Returns the (possibly new)
    /// base address; contents up to `min(old_len, new_len)` are preserved.
    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize) -> Result<usize, SysError>;
}

/// Header persistence and payload byte operations.
///
/// Addresses passed here are always header or payload addresses inside
/// regions the allocator obtained from the other two capabilities, or
/// addresses a caller handed back to `free`/`realloc`. Implementations over
/// raw memory rely on the caller honoring that contract.
pub trait BlockMemory {
    /// Read the header stored at `header`.
    fn load(&self, header: usize) -> super::BlockHeader;

    /// Write `value` as the header at `header`.
    fn store(&mut self, header: usize, value: super::BlockHeader);

    /// Fill `[addr, addr+len)` with zero bytes.
    fn zero(&mut self, addr: usize, len: usize);

    /// Copy `len` bytes from `src` to `dst`. The ranges may overlap.
    fn copy(&mut self, src: usize, dst: usize, len: usize);
}

/// Everything [`super::MallocState`] needs from its environment.
pub trait SystemMemory: BreakBoundary + PageMapper + BlockMemory {}

impl<T: BreakBoundary + PageMapper + BlockMemory> SystemMemory for T {}
