//! Virtual memory constants used by the large-object path.
//!
//! Values match `<sys/mman.h>` on Linux.

// ---------------------------------------------------------------------------
// Protection flags (PROT_*)
// ---------------------------------------------------------------------------

/// Pages can be read.
pub const PROT_READ: i32 = 0x1;
/// Pages can be written.
pub const PROT_WRITE: i32 = 0x2;

// ---------------------------------------------------------------------------
// Mapping flags (MAP_*)
// ---------------------------------------------------------------------------

/// Create a private copy-on-write mapping.
pub const MAP_PRIVATE: i32 = 0x02;
/// The mapping is not backed by any file; contents are initialized to zero.
pub const MAP_ANONYMOUS: i32 = 0x20;
/// Do not reserve swap space; pages are committed on first touch.
pub const MAP_NORESERVE: i32 = 0x4000;

/// Returned by mmap on failure (equivalent to `(void *)-1`).
pub const MAP_FAILED: usize = usize::MAX;

// ---------------------------------------------------------------------------
// mremap flags (MREMAP_*)
// ---------------------------------------------------------------------------

/// The kernel may relocate the mapping if it cannot grow in place.
pub const MREMAP_MAYMOVE: i32 = 0x1;

/// Protection used for every allocator mapping.
pub const ALLOC_PROT: i32 = PROT_READ | PROT_WRITE;
/// Flags used for every allocator mapping.
pub const ALLOC_FLAGS: i32 = MAP_PRIVATE | MAP_ANONYMOUS;
/// Flags for a large address-space reservation that is only partly used.
pub const RESERVE_FLAGS: i32 = ALLOC_FLAGS | MAP_NORESERVE;
