//! Large allocation handling (>= [`MMAP_THRESHOLD`] bytes).
//!
//! Each large block owns one anonymous mapping: header at the mapping base,
//! payload right after it. The header records the total mapped length, so
//! releasing or resizing needs nothing but the header itself. That also means
//! these functions never touch the heap list and can run without the heap
//! lock held.

use super::block::{BlockHeader, MMAP_THRESHOLD, MappedBlock, checked_mapped_len_for, mapped_len_for};
use super::error::AllocError;
use super::system::{BlockMemory, PageMapper, SysError};
use crate::config::CheckMode;

/// True if a `len`-byte request belongs on the mapping path.
#[inline]
#[must_use]
pub const fn wants_mapping(len: usize, mmap_enabled: bool) -> bool {
    mmap_enabled && len >= MMAP_THRESHOLD
}

fn mapped_len(len: usize, mode: CheckMode) -> Result<usize, AllocError> {
    if mode.checks_overflow() {
        checked_mapped_len_for(len).ok_or(AllocError::SizeOverflow {
            what: "mapped length",
        })
    } else {
        Ok(mapped_len_for(len))
    }
}

/// Map a fresh region for a `len`-byte payload and write its header.
/// Returns the header address (the mapping base).
pub fn map_block<M: PageMapper + BlockMemory>(
    mem: &mut M,
    len: usize,
    mode: CheckMode,
) -> Result<usize, AllocError> {
    let mapped_len = mapped_len(len, mode)?;
    let header = mem
        .map(mapped_len)
        .map_err(|source| AllocError::MapFailed {
            len: mapped_len,
            source,
        })?;
    mem.store(header, BlockHeader::Mapped(MappedBlock { len: mapped_len }));
    Ok(header)
}

/// Return the whole mapping behind `block` to the OS.
pub fn unmap_block<M: PageMapper>(
    mem: &mut M,
    header: usize,
    block: MappedBlock,
) -> Result<(), SysError> {
    mem.unmap(header, block.len)
}

/// Resize the mapping behind `block` to fit a `len`-byte payload, letting it
/// move. Returns the new header address with the header updated. On failure
/// the original mapping and header are untouched.
pub fn remap_block<M: PageMapper + BlockMemory>(
    mem: &mut M,
    header: usize,
    block: MappedBlock,
    len: usize,
    mode: CheckMode,
) -> Result<usize, AllocError> {
    let new_len = mapped_len(len, mode)?;
    let moved = mem
        .remap(header, block.len, new_len)
        .map_err(|source| AllocError::RemapFailed {
            len: new_len,
            source,
        })?;
    mem.store(moved, BlockHeader::Mapped(MappedBlock { len: new_len }));
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::block::{HEADER_SIZE, PAGE_SIZE, payload_of};
    use crate::malloc::sim::SimulatedMemory;

    #[test]
    fn threshold_is_inclusive() {
        assert!(!wants_mapping(MMAP_THRESHOLD - 1, true));
        assert!(wants_mapping(MMAP_THRESHOLD, true));
        assert!(!wants_mapping(MMAP_THRESHOLD, false));
    }

    #[test]
    fn map_block_writes_header_with_total_length() {
        let mut mem = SimulatedMemory::new();
        let header = map_block(&mut mem, MMAP_THRESHOLD, CheckMode::Compat).unwrap();
        let expected = MMAP_THRESHOLD + PAGE_SIZE;
        assert_eq!(
            mem.load(header),
            BlockHeader::Mapped(MappedBlock { len: expected })
        );
        assert_eq!(mem.mapping_len(header), Some(expected));
        assert!(mem.read(payload_of(header), MMAP_THRESHOLD).iter().all(|&b| b == 0));
    }

    #[test]
    fn unmap_releases_the_full_length() {
        let mut mem = SimulatedMemory::new();
        let header = map_block(&mut mem, 100_000, CheckMode::Compat).unwrap();
        let block = MappedBlock {
            len: mapped_len_for(100_000),
        };
        unmap_block(&mut mem, header, block).unwrap();
        assert_eq!(mem.live_mappings(), 0);
        assert_eq!(mem.unmap_count(), 1);
    }

    #[test]
    fn remap_moves_contents_and_rewrites_header() {
        let mut mem = SimulatedMemory::new();
        let header = map_block(&mut mem, MMAP_THRESHOLD, CheckMode::Compat).unwrap();
        mem.write(payload_of(header), b"payload");
        let BlockHeader::Mapped(block) = mem.load(header) else {
            panic!("expected mapped header");
        };
        let moved = remap_block(&mut mem, header, block, 4 * MMAP_THRESHOLD, CheckMode::Compat)
            .unwrap();
        assert_eq!(mem.read(payload_of(moved), 7), b"payload");
        assert_eq!(
            mem.load(moved),
            BlockHeader::Mapped(MappedBlock {
                len: mapped_len_for(4 * MMAP_THRESHOLD)
            })
        );
    }

    #[test]
    fn failed_remap_keeps_the_block() {
        let mut mem = SimulatedMemory::new();
        let header = map_block(&mut mem, MMAP_THRESHOLD, CheckMode::Compat).unwrap();
        let before = mem.load(header);
        let BlockHeader::Mapped(block) = before else {
            panic!("expected mapped header");
        };
        mem.fail_next_remap();
        let err = remap_block(&mut mem, header, block, 2 * MMAP_THRESHOLD, CheckMode::Compat)
            .unwrap_err();
        assert!(matches!(err, AllocError::RemapFailed { .. }));
        assert_eq!(mem.load(header), before);
    }

    #[test]
    fn checked_mode_refuses_wrapping_lengths() {
        let mut mem = SimulatedMemory::new();
        let err = map_block(&mut mem, usize::MAX - HEADER_SIZE, CheckMode::Checked).unwrap_err();
        assert_eq!(
            err,
            AllocError::SizeOverflow {
                what: "mapped length"
            }
        );
        assert!(mem.calls().is_empty(), "no OS request on overflow");
    }
}
