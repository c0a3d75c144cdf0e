//! Allocator collaborators over the running process.
//!
//! [`ProcessPages`] issues the mapping syscalls and reads/writes headers and
//! payload bytes in place. The heap segment comes from one of two
//! [`BreakBoundary`] implementations:
//! - [`ProgramBreak`] moves the real program break with `brk(2)`. Only sound
//!   when nothing else in the process uses the break, i.e. when lmem is the
//!   process allocator.
//! - [`ReservedBreak`] emulates a break inside one large `MAP_NORESERVE`
//!   reservation. Used when lmem shares the process with another allocator
//!   (debug and test builds, where the exported symbols are not
//!   interposed).

use lmem_core::errno::ENOMEM;
use lmem_core::malloc::{
    BlockHeader, BlockMemory, BreakBoundary, MAPPED_SENTINEL, MappedBlock, PageMapper, SysError,
};
use lmem_core::syscall::{sys_brk, sys_mmap_anonymous, sys_mmap_reserve, sys_munmap, sys_mremap};

const WORD: usize = core::mem::size_of::<usize>();

/// Address space reserved for the heap segment when the real break is not
/// ours (1 GiB).
pub const RESERVED_HEAP_SPAN: usize = 1 << 30;

/// Anonymous mappings plus raw access to process memory.
#[derive(Debug)]
pub struct ProcessPages {
    _private: (),
}

impl ProcessPages {
    /// # Safety
    ///
    /// Every address later handed to this value must honor the
    /// [`BlockMemory`] and [`PageMapper`] contracts against the real address
    /// space: headers and payloads inside live allocator regions, mappings
    /// previously returned by `map`/`remap`.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// The mapped-block view of the header at `header`, reading only the
    /// `size` and `next` words.
    ///
    /// Neighbouring frees may rewrite the `prev` word of a live heap block
    /// while the heap lock is held elsewhere; the other two words of a live
    /// block are stable, so this check is safe without the lock.
    #[must_use]
    pub fn mapped_block(&self, header: usize) -> Option<MappedBlock> {
        let base = header as *const usize;
        // SAFETY: `header` is the header of a live block per the constructor
        // contract; words 1 and 3 are not written while the block is live.
        let (size, next) = unsafe { (base.add(1).read_unaligned(), base.add(3).read_unaligned()) };
        (next == MAPPED_SENTINEL).then_some(MappedBlock { len: size })
    }
}

impl PageMapper for ProcessPages {
    fn map(&mut self, len: usize) -> Result<usize, SysError> {
        sys_mmap_anonymous(len).map_err(|errno| SysError::MapFailed { errno })
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), SysError> {
        // SAFETY: `addr`/`len` describe a mapping this allocator created and
        // whose block the caller has given up.
        unsafe { sys_munmap(addr, len) }.map_err(|errno| SysError::UnmapFailed { errno })
    }

    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize) -> Result<usize, SysError> {
        // SAFETY: `addr`/`old_len` describe a live mapping this allocator
        // created; the caller switches to the returned base.
        unsafe { sys_mremap(addr, old_len, new_len) }
            .map_err(|errno| SysError::RemapFailed { errno })
    }
}

impl BlockMemory for ProcessPages {
    fn load(&self, header: usize) -> BlockHeader {
        // SAFETY: constructor contract; headers are four readable words.
        let words = unsafe { (header as *const [usize; 4]).read_unaligned() };
        BlockHeader::from_words(words)
    }

    fn store(&mut self, header: usize, value: BlockHeader) {
        // SAFETY: constructor contract; headers are four writable words.
        unsafe { (header as *mut [usize; 4]).write_unaligned(value.to_words()) };
    }

    fn zero(&mut self, addr: usize, len: usize) {
        // SAFETY: `[addr, addr+len)` is a payload the allocator just handed out.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    }

    fn copy(&mut self, src: usize, dst: usize, len: usize) {
        // SAFETY: both ranges lie in allocator-owned memory; `ptr::copy`
        // tolerates overlap.
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
    }
}

/// The real program break.
#[derive(Debug)]
pub struct ProgramBreak {
    current: usize,
}

impl ProgramBreak {
    /// # Safety
    ///
    /// Nothing else in the process may move the program break for the
    /// lifetime of the allocator using this value.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { current: 0 }
    }
}

impl BreakBoundary for ProgramBreak {
    fn query(&mut self) -> usize {
        // SAFETY: a zero argument never moves the break.
        self.current = unsafe { sys_brk(0) };
        self.current
    }

    fn extend(&mut self, new_break: usize) -> Result<usize, SysError> {
        if self.current == 0 {
            self.query();
        }
        let previous = self.current;
        // SAFETY: the constructor contract makes the break ours, and the heap
        // list only ever asks for a higher break.
        let result = unsafe { sys_brk(new_break) };
        if result < new_break {
            return Err(SysError::BreakExhausted { errno: ENOMEM });
        }
        self.current = result;
        Ok(previous)
    }
}

/// A break emulated inside one address-space reservation.
#[derive(Debug)]
pub struct ReservedBreak {
    base: usize,
    end: usize,
    span: usize,
}

impl ReservedBreak {
    /// Reserve `span` bytes; the emulated break starts at the base.
    pub fn reserve(span: usize) -> Result<Self, SysError> {
        let base = sys_mmap_reserve(span).map_err(|errno| SysError::BreakExhausted { errno })?;
        Ok(Self {
            base,
            end: base,
            span,
        })
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn span(&self) -> usize {
        self.span
    }
}

impl BreakBoundary for ReservedBreak {
    fn query(&mut self) -> usize {
        self.end
    }

    fn extend(&mut self, new_break: usize) -> Result<usize, SysError> {
        if new_break < self.base || new_break - self.base > self.span {
            return Err(SysError::BreakExhausted { errno: ENOMEM });
        }
        let previous = self.end;
        self.end = new_break;
        Ok(previous)
    }
}

impl Drop for ReservedBreak {
    fn drop(&mut self) {
        // SAFETY: the reservation is ours; dropping the break means the heap
        // built on it is gone.
        let _ = unsafe { sys_munmap(self.base, self.span) };
    }
}

/// Break implementation the process-wide allocator uses.
#[cfg(not(debug_assertions))]
pub type ProcessBreak = ProgramBreak;
/// Break implementation the process-wide allocator uses.
#[cfg(debug_assertions)]
pub type ProcessBreak = ReservedBreak;

/// Every allocator capability over the running process.
#[derive(Debug)]
pub struct LinuxSystem<B = ProcessBreak> {
    brk: B,
    pages: ProcessPages,
}

impl LinuxSystem<ReservedBreak> {
    /// System whose heap segment lives in a private `span`-byte reservation.
    pub fn with_reserved_heap(span: usize) -> Result<Self, SysError> {
        Ok(Self {
            brk: ReservedBreak::reserve(span)?,
            // SAFETY: the allocator owning this system only hands back
            // addresses it produced.
            pages: unsafe { ProcessPages::new() },
        })
    }
}

impl LinuxSystem<ProgramBreak> {
    /// System whose heap segment is the real program break.
    ///
    /// # Safety
    ///
    /// See [`ProgramBreak::new`].
    #[must_use]
    pub unsafe fn with_program_break() -> Self {
        Self {
            // SAFETY: forwarded to the caller.
            brk: unsafe { ProgramBreak::new() },
            // SAFETY: the allocator owning this system only hands back
            // addresses it produced.
            pages: unsafe { ProcessPages::new() },
        }
    }
}

impl<B> LinuxSystem<B> {
    /// The break collaborator.
    pub fn break_boundary(&self) -> &B {
        &self.brk
    }
}

/// The system the process-wide allocator runs on.
#[cfg(not(debug_assertions))]
pub fn process_system() -> Result<LinuxSystem, SysError> {
    // SAFETY: release builds export the malloc family, so lmem is the process
    // allocator and owns the break.
    Ok(unsafe { LinuxSystem::with_program_break() })
}

/// The system the process-wide allocator runs on.
#[cfg(debug_assertions)]
pub fn process_system() -> Result<LinuxSystem, SysError> {
    LinuxSystem::with_reserved_heap(RESERVED_HEAP_SPAN)
}

impl<B: BreakBoundary> BreakBoundary for LinuxSystem<B> {
    fn query(&mut self) -> usize {
        self.brk.query()
    }

    fn extend(&mut self, new_break: usize) -> Result<usize, SysError> {
        self.brk.extend(new_break)
    }
}

impl<B> PageMapper for LinuxSystem<B> {
    fn map(&mut self, len: usize) -> Result<usize, SysError> {
        self.pages.map(len)
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), SysError> {
        self.pages.unmap(addr, len)
    }

    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize) -> Result<usize, SysError> {
        self.pages.remap(addr, old_len, new_len)
    }
}

impl<B> BlockMemory for LinuxSystem<B> {
    fn load(&self, header: usize) -> BlockHeader {
        self.pages.load(header)
    }

    fn store(&mut self, header: usize, value: BlockHeader) {
        self.pages.store(header, value);
    }

    fn zero(&mut self, addr: usize, len: usize) {
        self.pages.zero(addr, len);
    }

    fn copy(&mut self, src: usize, dst: usize, len: usize) {
        self.pages.copy(src, dst, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_break_moves_within_its_span() {
        let mut brk = ReservedBreak::reserve(1 << 20).unwrap();
        let base = brk.query();
        assert_eq!(base, brk.base());
        assert_eq!(brk.extend(base + 4096), Ok(base));
        assert_eq!(brk.query(), base + 4096);
        assert!(brk.extend(base + (1 << 20) + 1).is_err());
        assert_eq!(brk.query(), base + 4096, "failed extension keeps the break");
    }

    #[test]
    fn program_break_query_is_nonzero() {
        // SAFETY: only the query path is exercised; the break never moves.
        let mut brk = unsafe { ProgramBreak::new() };
        assert!(brk.query() > 0);
    }

    #[test]
    fn headers_round_trip_in_real_memory() {
        let mut system = LinuxSystem::with_reserved_heap(1 << 20).unwrap();
        let base = system.query();
        system.extend(base + 256).unwrap();
        let header = BlockHeader::Mapped(MappedBlock { len: 8192 });
        system.store(base, header);
        assert_eq!(system.load(base), header);
        assert_eq!(system.pages.mapped_block(base), Some(MappedBlock { len: 8192 }));
    }
}
