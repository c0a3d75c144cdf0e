//! Simulated system backend.
//!
//! [`SimulatedMemory`] implements every allocator capability over owned byte
//! buffers, so the full allocator (headers, payload bytes, break growth,
//! mappings) runs deterministically in safe Rust. Headers are encoded into the
//! simulated bytes with [`BlockHeader::to_words`], exactly as the ABI layer
//! lays them out in real memory.
//!
//! Every OS-level request is recorded as a [`SysCall`], and each collaborator
//! can be told to fail its next call.

use std::collections::BTreeMap;

use super::block::{BlockHeader, PAGE_SIZE};
use super::system::{BlockMemory, BreakBoundary, PageMapper, SysError};
use crate::errno::{EINVAL, ENOMEM};

/// Initial break of a simulated heap segment.
pub const SIM_HEAP_BASE: usize = 0x0010_0000;

/// Default ceiling on the simulated segment size (64 MiB).
pub const SIM_DEFAULT_HEAP_LIMIT: usize = 64 * 1024 * 1024;

/// First address handed out for simulated mappings.
pub const SIM_MAP_BASE: usize = 0x4000_0000;

const WORD: usize = core::mem::size_of::<usize>();

/// One recorded collaborator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysCall {
    Query { result: usize },
    Extend { new_break: usize, ok: bool },
    Map { len: usize, addr: Option<usize> },
    Unmap { addr: usize, len: usize, ok: bool },
    Remap { addr: usize, old_len: usize, new_len: usize, new_addr: Option<usize> },
}

/// Byte-backed stand-in for the process break segment and anonymous mappings.
#[derive(Debug, Clone)]
pub struct SimulatedMemory {
    heap_base: usize,
    /// Bytes in `[heap_base, heap_base + heap.len())`; the break is the end.
    heap: Vec<u8>,
    heap_limit: usize,
    mappings: BTreeMap<usize, Vec<u8>>,
    next_map: usize,
    calls: Vec<SysCall>,
    fail_extend: bool,
    fail_map: bool,
    fail_unmap: bool,
    fail_remap: bool,
}

impl SimulatedMemory {
    /// Empty segment at [`SIM_HEAP_BASE`] with the default ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_heap_limit(SIM_DEFAULT_HEAP_LIMIT)
    }

    /// Empty segment that refuses to grow past `limit` bytes.
    #[must_use]
    pub fn with_heap_limit(limit: usize) -> Self {
        Self {
            heap_base: SIM_HEAP_BASE,
            heap: Vec::new(),
            heap_limit: limit,
            mappings: BTreeMap::new(),
            next_map: SIM_MAP_BASE,
            calls: Vec::new(),
            fail_extend: false,
            fail_map: false,
            fail_unmap: false,
            fail_remap: false,
        }
    }

    /// Make the next `extend` fail with `ENOMEM`.
    pub fn fail_next_extend(&mut self) {
        self.fail_extend = true;
    }

    /// Make the next `map` fail with `ENOMEM`.
    pub fn fail_next_map(&mut self) {
        self.fail_map = true;
    }

    /// Make the next `unmap` fail with `EINVAL`.
    pub fn fail_next_unmap(&mut self) {
        self.fail_unmap = true;
    }

    /// Make the next `remap` fail with `ENOMEM`.
    pub fn fail_next_remap(&mut self) {
        self.fail_remap = true;
    }

    /// Every collaborator request so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> &[SysCall] {
        &self.calls
    }

    /// Forget recorded requests.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of successful `extend` requests.
    #[must_use]
    pub fn extend_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, SysCall::Extend { ok: true, .. }))
            .count()
    }

    /// Number of successful `unmap` requests.
    #[must_use]
    pub fn unmap_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, SysCall::Unmap { ok: true, .. }))
            .count()
    }

    /// Base of the segment.
    #[must_use]
    pub fn heap_base(&self) -> usize {
        self.heap_base
    }

    /// Current break.
    #[must_use]
    pub fn heap_break(&self) -> usize {
        self.heap_base + self.heap.len()
    }

    /// Number of live mappings.
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.mappings.len()
    }

    /// Length of the live mapping based at `addr`, if any.
    #[must_use]
    pub fn mapping_len(&self, addr: usize) -> Option<usize> {
        self.mappings.get(&addr).map(Vec::len)
    }

    /// Borrow `len` bytes at `addr`.
    ///
    /// # Panics
    ///
    /// Panics (a simulated fault) if the range is not inside the segment or
    /// a single mapping.
    #[must_use]
    pub fn read(&self, addr: usize, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        if let Some(start) = self.heap_offset(addr, len) {
            return &self.heap[start..start + len];
        }
        if let Some((base, bytes)) = self.mappings.range(..=addr).next_back() {
            let start = addr - base;
            if start + len <= bytes.len() {
                return &bytes[start..start + len];
            }
        }
        panic!("simulated fault: read of {len} bytes at {addr:#x}");
    }

    /// Overwrite bytes at `addr`.
    ///
    /// # Panics
    ///
    /// Panics (a simulated fault) if the range is not writable.
    pub fn write(&mut self, addr: usize, data: &[u8]) {
        self.region_mut(addr, data.len()).copy_from_slice(data);
    }

    /// Fill `len` bytes at `addr` with `byte`.
    pub fn fill(&mut self, addr: usize, byte: u8, len: usize) {
        self.region_mut(addr, len).fill(byte);
    }

    fn heap_offset(&self, addr: usize, len: usize) -> Option<usize> {
        let start = addr.checked_sub(self.heap_base)?;
        (start.checked_add(len)? <= self.heap.len()).then_some(start)
    }

    fn region_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        if let Some(start) = self.heap_offset(addr, len) {
            return &mut self.heap[start..start + len];
        }
        if let Some((base, bytes)) = self.mappings.range_mut(..=addr).next_back() {
            let start = addr - *base;
            if start + len <= bytes.len() {
                return &mut bytes[start..start + len];
            }
        }
        panic!("simulated fault: write of {len} bytes at {addr:#x}");
    }

    /// Copy source for payload moves. Segment bytes between the break and the
    /// ceiling have never been handed out and read as zero, the same as the
    /// untouched pages above a real break.
    fn read_for_copy(&self, addr: usize, len: usize) -> Vec<u8> {
        let ceiling = self.heap_base + self.heap_limit;
        let in_segment = addr >= self.heap_base && addr.saturating_add(len) <= ceiling;
        if in_segment && addr.saturating_add(len) > self.heap_break() {
            let mut out = vec![0u8; len];
            let present = self.heap_break().saturating_sub(addr).min(len);
            out[..present].copy_from_slice(self.read(addr, present));
            return out;
        }
        self.read(addr, len).to_vec()
    }
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakBoundary for SimulatedMemory {
    fn query(&mut self) -> usize {
        let result = self.heap_break();
        self.calls.push(SysCall::Query { result });
        result
    }

    fn extend(&mut self, new_break: usize) -> Result<usize, SysError> {
        let previous = self.heap_break();
        let within_limit = new_break >= self.heap_base && new_break - self.heap_base <= self.heap_limit;
        if std::mem::take(&mut self.fail_extend) || !within_limit {
            self.calls.push(SysCall::Extend { new_break, ok: false });
            return Err(SysError::BreakExhausted { errno: ENOMEM });
        }
        self.heap.resize(new_break - self.heap_base, 0);
        self.calls.push(SysCall::Extend { new_break, ok: true });
        Ok(previous)
    }
}

impl PageMapper for SimulatedMemory {
    fn map(&mut self, len: usize) -> Result<usize, SysError> {
        if std::mem::take(&mut self.fail_map) {
            self.calls.push(SysCall::Map { len, addr: None });
            return Err(SysError::MapFailed { errno: ENOMEM });
        }
        if len == 0 || len % PAGE_SIZE != 0 {
            self.calls.push(SysCall::Map { len, addr: None });
            return Err(SysError::MapFailed { errno: EINVAL });
        }
        let addr = self.next_map;
        // Leave a guard gap so a relocated mapping never abuts its old range.
        self.next_map += len + PAGE_SIZE;
        self.mappings.insert(addr, vec![0u8; len]);
        self.calls.push(SysCall::Map { len, addr: Some(addr) });
        Ok(addr)
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), SysError> {
        let known = self.mappings.get(&addr).is_some_and(|m| m.len() == len);
        if std::mem::take(&mut self.fail_unmap) || !known {
            self.calls.push(SysCall::Unmap { addr, len, ok: false });
            return Err(SysError::UnmapFailed { errno: EINVAL });
        }
        self.mappings.remove(&addr);
        self.calls.push(SysCall::Unmap { addr, len, ok: true });
        Ok(())
    }

    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize) -> Result<usize, SysError> {
        let known = self.mappings.get(&addr).is_some_and(|m| m.len() == old_len);
        let failed = std::mem::take(&mut self.fail_remap);
        if failed || !known || new_len == 0 || new_len % PAGE_SIZE != 0 {
            self.calls.push(SysCall::Remap { addr, old_len, new_len, new_addr: None });
            let errno = if failed { ENOMEM } else { EINVAL };
            return Err(SysError::RemapFailed { errno });
        }

        // Shrinking stays in place; growing always relocates, which keeps the
        // may-move path exercised.
        let new_addr = if new_len <= old_len {
            if let Some(bytes) = self.mappings.get_mut(&addr) {
                bytes.truncate(new_len);
            }
            addr
        } else {
            let mut bytes = self.mappings.remove(&addr).unwrap_or_default();
            bytes.resize(new_len, 0);
            let moved = self.next_map;
            self.next_map += new_len + PAGE_SIZE;
            self.mappings.insert(moved, bytes);
            moved
        };
        self.calls.push(SysCall::Remap {
            addr,
            old_len,
            new_len,
            new_addr: Some(new_addr),
        });
        Ok(new_addr)
    }
}

impl BlockMemory for SimulatedMemory {
    fn load(&self, header: usize) -> BlockHeader {
        let raw = self.read(header, 4 * WORD);
        let mut words = [0usize; 4];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(WORD)) {
            let mut buf = [0u8; WORD];
            buf.copy_from_slice(chunk);
            *word = usize::from_ne_bytes(buf);
        }
        BlockHeader::from_words(words)
    }

    fn store(&mut self, header: usize, value: BlockHeader) {
        let region = self.region_mut(header, 4 * WORD);
        for (chunk, word) in region.chunks_exact_mut(WORD).zip(value.to_words()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
    }

    fn zero(&mut self, addr: usize, len: usize) {
        self.fill(addr, 0, len);
    }

    fn copy(&mut self, src: usize, dst: usize, len: usize) {
        if len == 0 {
            return;
        }
        let bytes = self.read_for_copy(src, len);
        self.write(dst, &bytes);
    }
}
