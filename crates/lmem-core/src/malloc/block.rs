//! Block header model.
//!
//! Every region handed out by the allocator is prefixed by one header. Heap
//! blocks are measured in header-sized units (header included); mapped blocks
//! record their total mapped length in bytes.
//!
//! ```text
//!   header addr              payload addr = header + HEADER_SIZE
//!   ┌────────┬──────┬──────┬──────┬─────────────────────────────┐
//!   │is_free │ size │ prev │ next │ payload ...                 │
//!   └────────┴──────┴──────┴──────┴─────────────────────────────┘
//! ```
//!
//! In memory the header is four machine words. A `next` word of
//! [`MAPPED_SENTINEL`] marks a mapped block; everywhere above the encoding the
//! distinction is carried by [`BlockHeader`].

/// Size of one block header, and the granularity of heap block sizes.
pub const HEADER_SIZE: usize = 4 * core::mem::size_of::<usize>();

/// Page size assumed for mapping arithmetic.
pub const PAGE_SIZE: usize = 4096;

/// Requests of at least this many bytes bypass the heap list.
pub const MMAP_THRESHOLD: usize = PAGE_SIZE * 16;

/// `next` word value tagging a mapped block in the encoded header.
pub const MAPPED_SENTINEL: usize = usize::MAX;

/// A block that lives in the break segment and on the heap list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    /// True iff the block is not currently handed out.
    pub is_free: bool,
    /// Block length in header units, header included. Never zero.
    pub units: usize,
    /// Header address of the physically preceding block.
    pub prev: Option<usize>,
    /// Header address of the physically following block.
    pub next: Option<usize>,
}

impl HeapBlock {
    /// Block length in bytes, header included.
    #[must_use]
    pub const fn len_bytes(&self) -> usize {
        units_to_bytes(self.units)
    }
}

/// A block backed by its own anonymous mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    /// Total mapped length in bytes, page aligned.
    pub len: usize,
}

/// Header prefixed to every live or free region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHeader {
    Heap(HeapBlock),
    Mapped(MappedBlock),
}

impl BlockHeader {
    /// Encode as the four in-memory words `[is_free, size, prev, next]`.
    #[must_use]
    pub fn to_words(self) -> [usize; 4] {
        match self {
            Self::Heap(block) => [
                usize::from(block.is_free),
                block.units,
                block.prev.unwrap_or(0),
                block.next.unwrap_or(0),
            ],
            Self::Mapped(block) => [0, block.len, 0, MAPPED_SENTINEL],
        }
    }

    /// Decode the four in-memory words written by [`BlockHeader::to_words`].
    #[must_use]
    pub fn from_words(words: [usize; 4]) -> Self {
        let [is_free, size, prev, next] = words;
        if next == MAPPED_SENTINEL {
            return Self::Mapped(MappedBlock { len: size });
        }
        Self::Heap(HeapBlock {
            is_free: is_free != 0,
            units: size,
            prev: (prev != 0).then_some(prev),
            next: (next != 0).then_some(next),
        })
    }

    /// Returns the heap variant, if this is a heap block.
    #[must_use]
    pub const fn as_heap(self) -> Option<HeapBlock> {
        match self {
            Self::Heap(block) => Some(block),
            Self::Mapped(_) => None,
        }
    }
}

/// Payload address of the block whose header is at `header`.
#[inline]
#[must_use]
pub const fn payload_of(header: usize) -> usize {
    header + HEADER_SIZE
}

/// Header address of the block whose payload is at `payload`.
#[inline]
#[must_use]
pub const fn header_of(payload: usize) -> usize {
    payload - HEADER_SIZE
}

/// Converts header units to bytes.
#[inline]
#[must_use]
pub const fn units_to_bytes(units: usize) -> usize {
    units * HEADER_SIZE
}

/// Heap block size, in header units, needed for a `len`-byte payload:
/// `ceil(len / HEADER_SIZE) + 1`. Wraps on overflow.
#[inline]
#[must_use]
pub const fn units_for(len: usize) -> usize {
    len.wrapping_add(HEADER_SIZE - 1) / HEADER_SIZE + 1
}

/// Overflow-checked [`units_for`].
#[inline]
#[must_use]
pub const fn checked_units_for(len: usize) -> Option<usize> {
    match len.checked_add(HEADER_SIZE - 1) {
        Some(padded) => Some(padded / HEADER_SIZE + 1),
        None => None,
    }
}

/// Rounds a size up to the nearest page boundary. Wraps on overflow.
#[inline]
#[must_use]
pub const fn page_align(size: usize) -> usize {
    size.wrapping_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Mapped length for a `len`-byte payload: header plus payload, page aligned.
/// Wraps on overflow.
#[inline]
#[must_use]
pub const fn mapped_len_for(len: usize) -> usize {
    page_align(len.wrapping_add(HEADER_SIZE))
}

/// Overflow-checked [`mapped_len_for`].
#[inline]
#[must_use]
pub const fn checked_mapped_len_for(len: usize) -> Option<usize> {
    match len.checked_add(HEADER_SIZE + PAGE_SIZE - 1) {
        Some(padded) => Some(padded & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_words() {
        assert_eq!(HEADER_SIZE, 4 * core::mem::size_of::<usize>());
        assert_eq!(MMAP_THRESHOLD, 65536);
    }

    #[test]
    fn units_always_cover_the_header() {
        assert_eq!(units_for(0), 1);
        assert_eq!(units_for(1), 2);
        assert_eq!(units_for(HEADER_SIZE), 2);
        assert_eq!(units_for(HEADER_SIZE + 1), 3);
        assert_eq!(checked_units_for(100), Some(units_for(100)));
    }

    #[test]
    fn unchecked_units_wrap_checked_units_refuse() {
        assert_eq!(units_for(usize::MAX), 1, "compat arithmetic wraps");
        assert_eq!(checked_units_for(usize::MAX), None);
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(page_align(1), 4096);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(4097), 8192);
        assert_eq!(page_align(0), 0);
    }

    #[test]
    fn mapped_len_includes_header() {
        assert_eq!(mapped_len_for(PAGE_SIZE - HEADER_SIZE), PAGE_SIZE);
        assert_eq!(mapped_len_for(PAGE_SIZE - HEADER_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(mapped_len_for(MMAP_THRESHOLD), MMAP_THRESHOLD + PAGE_SIZE);
        assert_eq!(checked_mapped_len_for(MMAP_THRESHOLD), Some(MMAP_THRESHOLD + PAGE_SIZE));
        assert_eq!(checked_mapped_len_for(usize::MAX - 8), None);
        assert_eq!(
            mapped_len_for(usize::MAX - 8),
            PAGE_SIZE,
            "compat arithmetic wraps to a tiny mapping"
        );
    }

    #[test]
    fn word_encoding_keeps_the_tag() {
        let heap = BlockHeader::Heap(HeapBlock {
            is_free: true,
            units: 7,
            prev: Some(0x1000),
            next: None,
        });
        assert_eq!(heap.to_words(), [1, 7, 0x1000, 0]);
        assert_eq!(BlockHeader::from_words(heap.to_words()), heap);

        let mapped = BlockHeader::Mapped(MappedBlock { len: 2 * PAGE_SIZE });
        assert_eq!(mapped.to_words()[3], MAPPED_SENTINEL);
        assert_eq!(BlockHeader::from_words(mapped.to_words()), mapped);
        assert_eq!(mapped.as_heap(), None);
    }

    #[test]
    fn payload_and_header_are_inverse() {
        assert_eq!(header_of(payload_of(0x4000)), 0x4000);
        assert_eq!(payload_of(0x4000) - 0x4000, HEADER_SIZE);
    }
}
