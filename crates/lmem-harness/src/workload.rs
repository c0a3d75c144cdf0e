//! Seeded random workloads.
//!
//! A [`Workload`] drives a pseudo-random mix of `malloc`, `calloc`, `realloc`
//! and `free` through an allocator over simulated memory. Every live block
//! carries a tag byte in its leading bytes; the tag is checked before the
//! block is resized or released, and the heap list is audited after every
//! step. The same seed always produces the same call sequence and the same
//! final layout digest.

use lmem_core::config::{AllocatorConfig, CheckMode};
use lmem_core::malloc::{HeapAuditError, MMAP_THRESHOLD, MallocState, SimulatedMemory};
use serde::Serialize;
use thiserror::Error;

use crate::runner::{HeapStats, layout_digest};
use crate::structured_log::{LogEntry, LogLevel, Outcome, StreamKind};

/// Leading payload bytes tagged and verified per block.
const TAGGED_PREFIX: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("step {step}: heap audit failed: {source}")]
    Corrupted {
        step: usize,
        #[source]
        source: HeapAuditError,
    },
    #[error("step {step}: block {ptr:#x} lost its contents")]
    ContentLost { step: usize, ptr: usize },
    #[error("step {step}: calloc block {ptr:#x} is not zeroed")]
    NotZeroed { step: usize, ptr: usize },
}

/// Totals of one workload run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub seed: u64,
    pub steps: usize,
    pub mode: &'static str,
    pub mallocs: usize,
    pub callocs: usize,
    pub reallocs: usize,
    pub frees: usize,
    /// Allocating calls that returned an error.
    pub failures: usize,
    pub peak_live: usize,
    pub heap: HeapStats,
    pub digest: String,
}

impl WorkloadReport {
    /// The `workload_result` entry summarizing this run.
    #[must_use]
    pub fn summary_entry(&self) -> LogEntry {
        LogEntry::new(String::new(), LogLevel::Info, "workload_result")
            .with_stream(StreamKind::Workload)
            .with_case(format!("seed-{:016x}", self.seed))
            .with_outcome(Outcome::Pass)
            .with_details(serde_json::json!({
                "steps": self.steps,
                "mallocs": self.mallocs,
                "callocs": self.callocs,
                "reallocs": self.reallocs,
                "frees": self.frees,
                "failures": self.failures,
                "peak_live": self.peak_live,
                "digest": self.digest,
            }))
    }
}

/// Seeded random call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub seed: u64,
    pub steps: usize,
    pub mode: CheckMode,
    pub mmap: bool,
    /// Upper bound (exclusive) on a single request.
    pub max_len: usize,
    /// Live blocks beyond which the next step is always a `free`.
    pub max_live: usize,
    /// Record allocator lifecycle entries.
    pub logging: bool,
}

struct LiveBlock {
    ptr: usize,
    len: usize,
    tag: u8,
}

fn lcg(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
    *state
}

impl Workload {
    /// Compat-mode workload with mappings on and requests spanning both
    /// paths.
    #[must_use]
    pub fn new(seed: u64, steps: usize) -> Self {
        Self {
            seed,
            steps,
            mode: CheckMode::Compat,
            mmap: true,
            max_len: MMAP_THRESHOLD + 4 * 4096,
            max_live: 64,
            logging: false,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_mmap(mut self, enabled: bool) -> Self {
        self.mmap = enabled;
        self
    }

    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    #[must_use]
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Run the workload on a fresh allocator. Returns the report and the
    /// allocator lifecycle entries (empty unless logging is on).
    pub fn run(&self) -> Result<(WorkloadReport, Vec<LogEntry>), WorkloadError> {
        let config = AllocatorConfig::new()
            .with_mode(self.mode)
            .with_mmap(self.mmap)
            .with_lifecycle_logging(self.logging);
        let mut state = MallocState::with_config(SimulatedMemory::new(), config);
        let mut live: Vec<LiveBlock> = Vec::new();
        let mut rng = self.seed;
        let mut report = WorkloadReport {
            seed: self.seed,
            steps: self.steps,
            mode: self.mode.as_str(),
            mallocs: 0,
            callocs: 0,
            reallocs: 0,
            frees: 0,
            failures: 0,
            peak_live: 0,
            heap: HeapStats::default(),
            digest: String::new(),
        };

        for step in 0..self.steps {
            let r = lcg(&mut rng);
            let tag = (step % 251) as u8 + 1;
            let choice = if live.is_empty() {
                0
            } else if live.len() >= self.max_live {
                4
            } else {
                r % 8
            };

            match choice {
                0..=2 => {
                    report.mallocs += 1;
                    let len = (r >> 8) as usize % self.max_len;
                    match state.malloc(len) {
                        Ok(ptr) => {
                            tag_block(&mut state, ptr, len, tag);
                            live.push(LiveBlock { ptr, len, tag });
                        }
                        Err(_) => report.failures += 1,
                    }
                }
                3 => {
                    report.callocs += 1;
                    let count = 1 + (r >> 8) as usize % 16;
                    let size = (r >> 16) as usize % (self.max_len / 16).max(1);
                    let len = count * size;
                    match state.calloc(count, size) {
                        Ok(ptr) => {
                            let prefix = len.min(TAGGED_PREFIX);
                            if state.memory().read(ptr, prefix).iter().any(|&b| b != 0) {
                                return Err(WorkloadError::NotZeroed { step, ptr });
                            }
                            tag_block(&mut state, ptr, len, tag);
                            live.push(LiveBlock { ptr, len, tag });
                        }
                        Err(_) => report.failures += 1,
                    }
                }
                4 | 5 => {
                    report.frees += 1;
                    let victim = live.swap_remove((r >> 24) as usize % live.len());
                    check_tag(&state, &victim, victim.len, step)?;
                    state.free(victim.ptr);
                }
                _ => {
                    report.reallocs += 1;
                    let index = (r >> 24) as usize % live.len();
                    let new_len = (r >> 8) as usize % self.max_len;
                    let block = &live[index];
                    check_tag(&state, block, block.len, step)?;
                    match state.realloc(block.ptr, new_len) {
                        Ok(ptr) => {
                            let moved = LiveBlock {
                                ptr,
                                len: new_len,
                                tag: block.tag,
                            };
                            check_tag(&state, &moved, block.len.min(new_len), step)?;
                            tag_block(&mut state, ptr, new_len, tag);
                            live[index] = LiveBlock {
                                ptr,
                                len: new_len,
                                tag,
                            };
                        }
                        Err(_) => report.failures += 1,
                    }
                }
            }

            report.peak_live = report.peak_live.max(live.len());
            state
                .audit()
                .map_err(|source| WorkloadError::Corrupted { step, source })?;
        }

        report.heap = HeapStats::capture(&state);
        report.digest = layout_digest(&state);
        let run_id = format!("workload-{:016x}", self.seed);
        let logs = state
            .drain_lifecycle_logs()
            .iter()
            .map(|record| LogEntry::from_allocator_record(record, self.mode).with_run(&run_id))
            .collect();
        Ok((report, logs))
    }
}

fn tag_block(state: &mut MallocState<SimulatedMemory>, ptr: usize, len: usize, tag: u8) {
    state.memory_mut().fill(ptr, tag, len.min(TAGGED_PREFIX));
}

fn check_tag(
    state: &MallocState<SimulatedMemory>,
    block: &LiveBlock,
    len: usize,
    step: usize,
) -> Result<(), WorkloadError> {
    let prefix = len.min(TAGGED_PREFIX);
    if state
        .memory()
        .read(block.ptr, prefix)
        .iter()
        .all(|&b| b == block.tag)
    {
        Ok(())
    } else {
        Err(WorkloadError::ContentLost {
            step,
            ptr: block.ptr,
        })
    }
}
