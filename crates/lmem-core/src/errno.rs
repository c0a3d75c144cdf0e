//! Error numbers surfaced by the allocator entrypoints.

/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Out of memory.
pub const ENOMEM: i32 = 12;
