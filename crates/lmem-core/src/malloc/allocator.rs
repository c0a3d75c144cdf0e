//! Core allocator state.
//!
//! [`MallocState`] owns the system collaborator, the heap list anchors and
//! the configuration, and implements the four public operations on top of
//! [`super::heap`] and [`super::large`]. Addresses in and out are plain
//! `usize` payload addresses; `0` stands for null.

use super::block::{
    BlockHeader, HEADER_SIZE, HeapBlock, checked_units_for, header_of, payload_of, units_for,
    units_to_bytes,
};
use super::error::AllocError;
use super::heap::{HeapAuditError, HeapList, HeapSummary, Placement};
use super::large;
use super::system::SystemMemory;
use crate::config::AllocatorConfig;

/// Which backing store holds a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPath {
    /// Carved from the break segment and linked on the heap list.
    Heap,
    /// Backed by a dedicated anonymous mapping.
    Mapped,
}

impl AllocPath {
    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heap => "heap",
            Self::Mapped => "mapped",
        }
    }
}

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `calloc`, `realloc`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `coalesce`, ...).
    pub event: &'static str,
    /// Payload address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Backing store involved in the event.
    pub path: Option<AllocPath>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
}

/// The allocator: one heap list over one system collaborator.
pub struct MallocState<M> {
    /// Break boundary, mappings and raw memory.
    memory: M,
    /// Heap list anchors and growth cursor.
    heap: HeapList,
    config: AllocatorConfig,
    /// Monotonic lifecycle decision id.
    next_decision_id: u64,
    /// Structured allocator lifecycle records.
    lifecycle_logs: Vec<AllocatorLogRecord>,
}

impl<M> MallocState<M> {
    /// Allocator over `memory` with the compiled default configuration.
    pub const fn new(memory: M) -> Self {
        Self::with_config(memory, AllocatorConfig::new())
    }

    /// Allocator over `memory` with an explicit configuration.
    pub const fn with_config(memory: M, config: AllocatorConfig) -> Self {
        Self {
            memory,
            heap: HeapList::new(),
            config,
            next_decision_id: 1,
            lifecycle_logs: Vec::new(),
        }
    }

    pub const fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// The system collaborator.
    pub const fn memory(&self) -> &M {
        &self.memory
    }

    /// The system collaborator, mutably (fault injection, payload writes).
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Heap list anchors.
    pub const fn heap(&self) -> &HeapList {
        &self.heap
    }

    /// Returns a view of allocator lifecycle log records.
    pub fn lifecycle_logs(&self) -> &[AllocatorLogRecord] {
        &self.lifecycle_logs
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.lifecycle_logs)
    }

    fn logging(&self) -> bool {
        self.config.lifecycle_logging
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        path: Option<AllocPath>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if !self.logging() {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("lmem::malloc::{}::{:016x}", symbol, decision_id);
        self.lifecycle_logs.push(AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            path,
            outcome,
            details: details.into(),
        });
    }

    fn record_failure(
        &mut self,
        symbol: &'static str,
        size: usize,
        path: AllocPath,
        err: &AllocError,
    ) {
        if !self.logging() {
            return;
        }
        let event = match err {
            AllocError::SizeOverflow { .. } => "size_overflow",
            _ => "alloc_failed",
        };
        self.record_lifecycle(
            AllocatorLogLevel::Warn,
            symbol,
            event,
            None,
            Some(size),
            Some(path),
            "oom",
            err.to_string(),
        );
    }
}

impl<M: SystemMemory> MallocState<M> {
    /// Allocates a payload of at least `len` bytes and returns its address.
    pub fn malloc(&mut self, len: usize) -> Result<usize, AllocError> {
        self.malloc_as("malloc", len)
    }

    fn malloc_as(&mut self, symbol: &'static str, len: usize) -> Result<usize, AllocError> {
        if large::wants_mapping(len, self.config.mmap_enabled) {
            return match large::map_block(&mut self.memory, len, self.config.mode) {
                Ok(header) => {
                    let ptr = payload_of(header);
                    self.record_lifecycle(
                        AllocatorLogLevel::Trace,
                        symbol,
                        "alloc",
                        Some(ptr),
                        Some(len),
                        Some(AllocPath::Mapped),
                        "success",
                        "mapped",
                    );
                    Ok(ptr)
                }
                Err(err) => {
                    self.record_failure(symbol, len, AllocPath::Mapped, &err);
                    Err(err)
                }
            };
        }

        let placed = self.heap_units(len).and_then(|units| {
            match self.heap.take_first_fit(&mut self.memory, units) {
                Some(found) => Ok(found),
                None => self
                    .heap
                    .grow(&mut self.memory, units)
                    .map(|header| (header, Placement::Grow)),
            }
        });
        match placed {
            Ok((header, placement)) => {
                let ptr = payload_of(header);
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    symbol,
                    "alloc",
                    Some(ptr),
                    Some(len),
                    Some(AllocPath::Heap),
                    "success",
                    placement.as_str(),
                );
                Ok(ptr)
            }
            Err(err) => {
                self.record_failure(symbol, len, AllocPath::Heap, &err);
                Err(err)
            }
        }
    }

    fn heap_units(&self, len: usize) -> Result<usize, AllocError> {
        if !self.config.mode.checks_overflow() {
            return Ok(units_for(len));
        }
        checked_units_for(len).ok_or(AllocError::SizeOverflow {
            what: "heap block size",
        })
    }

    /// Allocates `count * size` bytes and zero-fills them.
    ///
    /// In compat mode the product wraps like the unchecked C expression; in
    /// checked mode an overflowing product is refused.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<usize, AllocError> {
        let total = if self.config.mode.checks_overflow() {
            let Some(total) = count.checked_mul(size) else {
                if self.logging() {
                    self.record_lifecycle(
                        AllocatorLogLevel::Warn,
                        "calloc",
                        "calloc_overflow",
                        None,
                        None,
                        None,
                        "denied",
                        format!("count={} size={}", count, size),
                    );
                }
                return Err(AllocError::SizeOverflow {
                    what: "calloc size",
                });
            };
            total
        } else {
            count.wrapping_mul(size)
        };

        let ptr = self.malloc_as("calloc", total)?;
        self.memory.zero(ptr, total);
        Ok(ptr)
    }

    /// Returns a block to the allocator. `0` is a no-op.
    ///
    /// `ptr` must be a live payload address returned by this state; anything
    /// else is undefined behavior.
    pub fn free(&mut self, ptr: usize) {
        if ptr == 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "free",
                "free_null",
                None,
                None,
                None,
                "noop",
                "null_pointer",
            );
            return;
        }

        let header = header_of(ptr);
        match self.memory.load(header) {
            BlockHeader::Mapped(block) => {
                match large::unmap_block(&mut self.memory, header, block) {
                    Ok(()) => self.record_lifecycle(
                        AllocatorLogLevel::Trace,
                        "free",
                        "free",
                        Some(ptr),
                        Some(block.len),
                        Some(AllocPath::Mapped),
                        "success",
                        "path=unmap",
                    ),
                    Err(err) => {
                        if self.logging() {
                            self.record_lifecycle(
                                AllocatorLogLevel::Error,
                                "free",
                                "unmap_failed",
                                Some(ptr),
                                Some(block.len),
                                Some(AllocPath::Mapped),
                                "leaked",
                                err.to_string(),
                            );
                        }
                    }
                }
            }
            BlockHeader::Heap(block) => {
                let merged = self.heap.release(&mut self.memory, header);
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "free",
                    "free",
                    Some(ptr),
                    Some(units_to_bytes(block.units)),
                    Some(AllocPath::Heap),
                    "success",
                    "path=heap",
                );
                if merged.merged_left || merged.merged_right {
                    self.record_lifecycle(
                        AllocatorLogLevel::Debug,
                        "free",
                        "coalesce",
                        Some(ptr),
                        None,
                        Some(AllocPath::Heap),
                        "merged",
                        merged.as_str(),
                    );
                }
            }
        }
    }

    /// Resizes the block at `ptr` to hold `len` bytes. `0` behaves as
    /// [`MallocState::malloc`].
    ///
    /// Mapped blocks are remapped and may move. Heap blocks always move: a
    /// new block is allocated, the payload copied, and the old block
    /// released. On failure the original block is untouched.
    pub fn realloc(&mut self, ptr: usize, len: usize) -> Result<usize, AllocError> {
        if ptr == 0 {
            let out = self.malloc_as("realloc", len);
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_null_as_malloc",
                out.ok(),
                Some(len),
                None,
                if out.is_ok() { "success" } else { "oom" },
                "ptr_was_null",
            );
            return out;
        }

        let header = header_of(ptr);
        match self.memory.load(header) {
            BlockHeader::Mapped(block) => {
                match large::remap_block(&mut self.memory, header, block, len, self.config.mode) {
                    Ok(moved) => {
                        let new_ptr = payload_of(moved);
                        self.record_lifecycle(
                            AllocatorLogLevel::Trace,
                            "realloc",
                            "realloc_remap",
                            Some(new_ptr),
                            Some(len),
                            Some(AllocPath::Mapped),
                            "success",
                            if moved == header { "in_place" } else { "moved" },
                        );
                        Ok(new_ptr)
                    }
                    Err(err) => {
                        self.record_failure("realloc", len, AllocPath::Mapped, &err);
                        Err(err)
                    }
                }
            }
            BlockHeader::Heap(block) => {
                let copy_len = if self.config.mode.checks_overflow() {
                    len.min(payload_capacity(block))
                } else {
                    len
                };
                let new_ptr = self.malloc_as("realloc", len)?;
                self.memory.copy(ptr, new_ptr, copy_len);
                self.free(ptr);
                if self.logging() {
                    self.record_lifecycle(
                        AllocatorLogLevel::Trace,
                        "realloc",
                        "realloc_move",
                        Some(new_ptr),
                        Some(len),
                        Some(AllocPath::Heap),
                        "success",
                        format!("old_ptr={:#x} copied={}", ptr, copy_len),
                    );
                }
                Ok(new_ptr)
            }
        }
    }

    /// Which backing store holds the live block at `ptr`; `None` for null.
    pub fn path_of(&self, ptr: usize) -> Option<AllocPath> {
        if ptr == 0 {
            return None;
        }
        Some(match self.memory.load(header_of(ptr)) {
            BlockHeader::Heap(_) => AllocPath::Heap,
            BlockHeader::Mapped(_) => AllocPath::Mapped,
        })
    }

    /// Bytes the live block at `ptr` can hold after its header.
    pub fn usable_size(&self, ptr: usize) -> usize {
        if ptr == 0 {
            return 0;
        }
        match self.memory.load(header_of(ptr)) {
            BlockHeader::Heap(block) => payload_capacity(block),
            BlockHeader::Mapped(block) => block.len.saturating_sub(HEADER_SIZE),
        }
    }

    /// Every heap block in address order.
    pub fn heap_blocks(&self) -> Vec<(usize, HeapBlock)> {
        self.heap.walk(&self.memory).collect()
    }

    /// Structural check of the heap list.
    pub fn audit(&self) -> Result<HeapSummary, HeapAuditError> {
        self.heap.audit(&self.memory)
    }
}

fn payload_capacity(block: HeapBlock) -> usize {
    units_to_bytes(block.units.saturating_sub(1))
}

impl<M: Default> Default for MallocState<M> {
    fn default() -> Self {
        Self::new(M::default())
    }
}
