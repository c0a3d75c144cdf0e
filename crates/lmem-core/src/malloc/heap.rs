//! The break-segment block list.
//!
//! Blocks tile the segment from the first block the allocator ever created up
//! to the growth cursor, with no gaps. The list is doubly linked through the
//! headers themselves and kept in address order, so "physically adjacent" and
//! "adjacent on the list" are the same thing. Searching is first-fit from the
//! lowest address.
//!
//! Coalescing happens on release only: a freed block merges with a free
//! predecessor, and then its successor (if free) merges into whatever block
//! now precedes it. After every release no two adjacent blocks are both free.

use thiserror::Error;

use super::block::{BlockHeader, HEADER_SIZE, HeapBlock, units_to_bytes};
use super::error::AllocError;
use super::system::{BlockMemory, BreakBoundary};

/// How a heap request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// A free block of exactly the right size was reused.
    Reuse,
    /// A larger free block was split; the upper part stayed free.
    Split,
    /// The break was extended for a new block at the end of the list.
    Grow,
}

impl Placement {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reuse => "heap_reuse",
            Self::Split => "heap_split",
            Self::Grow => "heap_grow",
        }
    }
}

/// Which neighbours absorbed a released block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Coalesce {
    /// The released block merged into its free predecessor.
    pub merged_left: bool,
    /// The free successor merged into the released region.
    pub merged_right: bool,
}

impl Coalesce {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match (self.merged_left, self.merged_right) {
            (false, false) => "none",
            (true, false) => "left",
            (false, true) => "right",
            (true, true) => "both",
        }
    }
}

/// Totals gathered by [`HeapList::audit`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapSummary {
    pub blocks: usize,
    pub free_blocks: usize,
    pub total_units: usize,
    pub free_units: usize,
    pub largest_free_units: usize,
}

/// Structural damage found by [`HeapList::audit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapAuditError {
    #[error("block {addr:#x} carries a mapped header")]
    MappedInList { addr: usize },
    #[error("block {addr:#x} has prev {found:?}, expected {expected:?}")]
    BrokenBackLink {
        addr: usize,
        expected: Option<usize>,
        found: Option<usize>,
    },
    #[error("block {addr:#x} has zero size")]
    ZeroSize { addr: usize },
    #[error("block {addr:#x} ends at {end:#x} but next is {next:#x}")]
    NotAdjacent { addr: usize, end: usize, next: usize },
    #[error("block {addr:#x} ends at {end:#x}, past the growth cursor")]
    PastCursor { addr: usize, end: usize },
    #[error("adjacent free blocks {left:#x} and {right:#x}")]
    AdjacentFree { left: usize, right: usize },
    #[error("list tail is {found:?}, walk ended at {expected:?}")]
    TailMismatch {
        expected: Option<usize>,
        found: Option<usize>,
    },
    #[error("last block ends at {end:#x}, growth cursor is {cursor:#x}")]
    CursorMismatch { end: usize, cursor: usize },
    #[error("walk revisited the list at {addr:#x}")]
    Cycle { addr: usize },
}

/// Anchors of the block list plus the lazily initialized growth cursor.
///
/// The headers live in the managed memory; this struct only remembers where
/// the list starts and ends and where the next block will be carved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapList {
    head: Option<usize>,
    tail: Option<usize>,
    cursor: Option<usize>,
}

fn heap_block<M: BlockMemory>(mem: &M, addr: usize) -> HeapBlock {
    match mem.load(addr) {
        BlockHeader::Heap(block) => block,
        BlockHeader::Mapped(_) => panic!("heap list links to a mapped header at {addr:#x}"),
    }
}

fn store_heap<M: BlockMemory>(mem: &mut M, addr: usize, block: HeapBlock) {
    mem.store(addr, BlockHeader::Heap(block));
}

impl HeapList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            cursor: None,
        }
    }

    /// Header address of the lowest block.
    #[must_use]
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    /// Header address of the highest block.
    #[must_use]
    pub const fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Address where the next grown block will start. `None` until the first
    /// growth reads the break.
    #[must_use]
    pub const fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Iterate `(header address, header)` from the lowest block upward.
    pub fn walk<'a, M: BlockMemory>(&self, mem: &'a M) -> HeapWalk<'a, M> {
        HeapWalk {
            mem,
            next: self.head,
        }
    }

    /// Lowest free block with at least `units` units.
    pub fn first_fit<M: BlockMemory>(&self, mem: &M, units: usize) -> Option<(usize, HeapBlock)> {
        self.walk(mem)
            .find(|(_, block)| block.is_free && block.units >= units)
    }

    /// Shrink `block` (at `addr`) to `units` and turn the remainder into a
    /// free block placed right after it. Returns the shrunk block; it is
    /// already stored.
    pub fn split<M: BlockMemory>(
        &mut self,
        mem: &mut M,
        addr: usize,
        mut block: HeapBlock,
        units: usize,
    ) -> HeapBlock {
        debug_assert!(units > 0 && units < block.units);
        let upper_addr = addr + units_to_bytes(units);
        let upper = HeapBlock {
            is_free: true,
            units: block.units - units,
            prev: Some(addr),
            next: block.next,
        };
        match block.next {
            Some(next_addr) => {
                let mut next = heap_block(mem, next_addr);
                next.prev = Some(upper_addr);
                store_heap(mem, next_addr, next);
            }
            None => self.tail = Some(upper_addr),
        }
        store_heap(mem, upper_addr, upper);

        block.units = units;
        block.next = Some(upper_addr);
        store_heap(mem, addr, block);
        block
    }

    /// First-fit search, splitting when the fit is larger than needed. The
    /// chosen block is marked in use.
    pub fn take_first_fit<M: BlockMemory>(
        &mut self,
        mem: &mut M,
        units: usize,
    ) -> Option<(usize, Placement)> {
        let (addr, mut block) = self.first_fit(mem, units)?;
        let placement = if block.units > units {
            block = self.split(mem, addr, block, units);
            Placement::Split
        } else {
            Placement::Reuse
        };
        block.is_free = false;
        store_heap(mem, addr, block);
        Some((addr, placement))
    }

    /// Extend the break by `units` units and append the new region as an
    /// in-use block. On failure the list and cursor are unchanged.
    pub fn grow<M: BreakBoundary + BlockMemory>(
        &mut self,
        mem: &mut M,
        units: usize,
    ) -> Result<usize, AllocError> {
        let start = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let cursor = mem.query();
                self.cursor = Some(cursor);
                cursor
            }
        };
        let new_break = units
            .checked_mul(HEADER_SIZE)
            .and_then(|bytes| start.checked_add(bytes))
            .ok_or(AllocError::AddressSpaceExhausted)?;
        mem.extend(new_break)
            .map_err(|source| AllocError::HeapExhausted { units, source })?;
        self.cursor = Some(new_break);

        store_heap(
            mem,
            start,
            HeapBlock {
                is_free: false,
                units,
                prev: self.tail,
                next: None,
            },
        );
        match self.tail {
            Some(tail_addr) => {
                let mut tail = heap_block(mem, tail_addr);
                tail.next = Some(start);
                store_heap(mem, tail_addr, tail);
            }
            None => self.head = Some(start),
        }
        self.tail = Some(start);
        Ok(start)
    }

    /// Mark the block at `addr` free and, if its predecessor is free, fold it
    /// into the predecessor. Returns true if a merge happened.
    pub fn left_merge<M: BlockMemory>(&mut self, mem: &mut M, addr: usize) -> bool {
        let mut block = heap_block(mem, addr);
        let prev = block.prev.map(|prev_addr| (prev_addr, heap_block(mem, prev_addr)));

        let Some((prev_addr, mut prev)) = prev.filter(|(_, prev)| prev.is_free) else {
            block.is_free = true;
            store_heap(mem, addr, block);
            return false;
        };

        prev.next = block.next;
        prev.units += block.units;
        match block.next {
            Some(next_addr) => {
                let mut next = heap_block(mem, next_addr);
                next.prev = Some(prev_addr);
                store_heap(mem, next_addr, next);
            }
            None => self.tail = Some(prev_addr),
        }
        store_heap(mem, prev_addr, prev);
        true
    }

    /// Return the in-use block at `addr` to the list, coalescing with both
    /// neighbours.
    pub fn release<M: BlockMemory>(&mut self, mem: &mut M, addr: usize) -> Coalesce {
        let successor = heap_block(mem, addr).next;
        let merged_left = self.left_merge(mem, addr);
        let merged_right = match successor {
            Some(next_addr) if heap_block(mem, next_addr).is_free => {
                self.left_merge(mem, next_addr)
            }
            _ => false,
        };
        Coalesce {
            merged_left,
            merged_right,
        }
    }

    /// Walk the whole list and check its structure.
    pub fn audit<M: BlockMemory>(&self, mem: &M) -> Result<HeapSummary, HeapAuditError> {
        let mut summary = HeapSummary::default();
        let limit = match (self.head, self.cursor) {
            (Some(head), Some(cursor)) if cursor > head => (cursor - head) / HEADER_SIZE,
            _ => 0,
        };

        let mut prev: Option<usize> = None;
        let mut prev_free: Option<usize> = None;
        let mut end = None;
        let mut current = self.head;
        while let Some(addr) = current {
            if summary.blocks >= limit {
                return Err(HeapAuditError::Cycle { addr });
            }
            let block = match mem.load(addr) {
                BlockHeader::Heap(block) => block,
                BlockHeader::Mapped(_) => return Err(HeapAuditError::MappedInList { addr }),
            };
            if block.prev != prev {
                return Err(HeapAuditError::BrokenBackLink {
                    addr,
                    expected: prev,
                    found: block.prev,
                });
            }
            if block.units == 0 {
                return Err(HeapAuditError::ZeroSize { addr });
            }
            let block_end = addr.saturating_add(block.len_bytes());
            if self.cursor.is_some_and(|cursor| block_end > cursor) {
                return Err(HeapAuditError::PastCursor {
                    addr,
                    end: block_end,
                });
            }
            if let Some(next) = block.next.filter(|&next| next != block_end) {
                return Err(HeapAuditError::NotAdjacent {
                    addr,
                    end: block_end,
                    next,
                });
            }
            if let Some(left) = prev_free.filter(|_| block.is_free) {
                return Err(HeapAuditError::AdjacentFree { left, right: addr });
            }

            summary.blocks += 1;
            summary.total_units += block.units;
            if block.is_free {
                summary.free_blocks += 1;
                summary.free_units += block.units;
                summary.largest_free_units = summary.largest_free_units.max(block.units);
            }
            prev = Some(addr);
            prev_free = block.is_free.then_some(addr);
            end = Some(block_end);
            current = block.next;
        }

        if self.tail != prev {
            return Err(HeapAuditError::TailMismatch {
                expected: prev,
                found: self.tail,
            });
        }
        match (end, self.cursor) {
            (Some(end), Some(cursor)) if end != cursor => {
                Err(HeapAuditError::CursorMismatch { end, cursor })
            }
            _ => Ok(summary),
        }
    }
}

/// Iterator returned by [`HeapList::walk`].
pub struct HeapWalk<'a, M> {
    mem: &'a M,
    next: Option<usize>,
}

impl<M: BlockMemory> Iterator for HeapWalk<'_, M> {
    type Item = (usize, HeapBlock);

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        let block = heap_block(self.mem, addr);
        self.next = block.next;
        Some((addr, block))
    }
}
