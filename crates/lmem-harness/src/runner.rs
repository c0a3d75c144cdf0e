//! Fixture replay engine.

use std::collections::BTreeMap;

use lmem_core::config::{AllocatorConfig, CheckMode};
use lmem_core::malloc::sim::SIM_DEFAULT_HEAP_LIMIT;
use lmem_core::malloc::{AllocError, AllocPath, HeapAuditError, MallocState, SimulatedMemory};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::fixtures::{Expectation, FaultKind, FixtureCase, FixtureSet, Op};
use crate::structured_log::{LogEntry, LogLevel, Outcome, StreamKind};

/// Why a replayed case stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("step {step}: slot '{slot}' was never assigned")]
    UnknownSlot { step: usize, slot: String },
    #[error("step {step}: slot '{slot}' is null")]
    NullSlot { step: usize, slot: String },
    #[error("step {step}: {len} bytes do not fit the {capacity}-byte block in '{slot}'")]
    OutOfBounds {
        step: usize,
        slot: String,
        len: usize,
        capacity: usize,
    },
    #[error("step {step}: expectation failed: {detail}")]
    Expectation { step: usize, detail: String },
    #[error("step {step}: heap audit failed: {source}")]
    Audit {
        step: usize,
        #[source]
        source: HeapAuditError,
    },
}

/// Heap and collaborator totals at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub total_units: usize,
    pub free_units: usize,
    pub largest_free_units: usize,
    pub break_extensions: usize,
    pub live_mappings: usize,
}

impl HeapStats {
    /// Snapshot of `state`; heap totals stay zero if the list fails its
    /// audit.
    #[must_use]
    pub fn capture(state: &MallocState<SimulatedMemory>) -> Self {
        let summary = state.audit().unwrap_or_default();
        Self {
            blocks: summary.blocks,
            free_blocks: summary.free_blocks,
            total_units: summary.total_units,
            free_units: summary.free_units,
            largest_free_units: summary.largest_free_units,
            break_extensions: state.memory().extend_count(),
            live_mappings: state.memory().live_mappings(),
        }
    }
}

/// Hex SHA-256 over the heap layout: every block's offset from the segment
/// base, size and free flag, in list order. Equal digests mean two runs
/// carved the segment identically.
#[must_use]
pub fn layout_digest(state: &MallocState<SimulatedMemory>) -> String {
    let base = state.memory().heap_base();
    let mut hasher = Sha256::new();
    for (addr, block) in state.heap_blocks() {
        hasher.update((addr - base).to_le_bytes());
        hasher.update(block.units.to_le_bytes());
        hasher.update([u8::from(block.is_free)]);
    }
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Outcome of one replayed case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub case_name: String,
    #[serde(serialize_with = "serialize_mode")]
    pub mode: CheckMode,
    pub passed: bool,
    /// Ops executed, including the failing one.
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub heap: HeapStats,
    pub digest: String,
    /// Allocator lifecycle entries recorded during the case.
    #[serde(skip)]
    pub logs: Vec<LogEntry>,
}

impl CaseResult {
    /// The `case_result` entry summarizing this case.
    #[must_use]
    pub fn summary_entry(&self) -> LogEntry {
        let (level, outcome) = if self.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        LogEntry::new(String::new(), level, "case_result")
            .with_stream(StreamKind::Replay)
            .with_mode(self.mode)
            .with_case(&self.case_name)
            .with_outcome(outcome)
            .with_details(serde_json::json!({
                "steps": self.steps,
                "failure": self.failure,
                "digest": self.digest,
            }))
    }
}

fn serialize_mode<S: serde::Serializer>(mode: &CheckMode, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(mode.as_str())
}

/// Replays fixture sets under one check mode.
pub struct ReplayRunner {
    /// Name of the replay campaign.
    pub campaign: String,
    /// Mode the allocator runs in.
    pub mode: CheckMode,
}

impl ReplayRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>, mode: CheckMode) -> Self {
        Self {
            campaign: campaign.into(),
            mode,
        }
    }

    /// Run every case of `fixture_set` that applies to this runner's mode.
    pub fn run(&self, fixture_set: &FixtureSet) -> Vec<CaseResult> {
        fixture_set
            .cases
            .iter()
            .filter(|case| case.runs_in(self.mode))
            .map(|case| self.run_case(case))
            .collect()
    }

    /// Replay a single case on a fresh allocator.
    pub fn run_case(&self, case: &FixtureCase) -> CaseResult {
        let memory =
            SimulatedMemory::with_heap_limit(case.heap_limit.unwrap_or(SIM_DEFAULT_HEAP_LIMIT));
        let config = AllocatorConfig::new()
            .with_mode(self.mode)
            .with_mmap(case.mmap)
            .with_lifecycle_logging(true);
        let mut replay = Replay {
            state: MallocState::with_config(memory, config),
            slots: BTreeMap::new(),
            last_error: None,
        };

        let mut steps = 0;
        let mut failure = None;
        for (step, op) in case.ops.iter().enumerate() {
            steps = step + 1;
            if let Err(err) = replay.apply(step, op) {
                failure = Some(err.to_string());
                break;
            }
        }

        let case_name = if case.mode.eq_ignore_ascii_case("both") {
            format!("{} [{}]", case.name, self.mode.as_str())
        } else {
            case.name.clone()
        };
        let logs = replay
            .state
            .drain_lifecycle_logs()
            .iter()
            .map(|record| {
                LogEntry::from_allocator_record(record, self.mode)
                    .with_run(&self.campaign)
                    .with_case(&case_name)
            })
            .collect();

        CaseResult {
            case_name,
            mode: self.mode,
            passed: failure.is_none(),
            steps,
            failure,
            heap: HeapStats::capture(&replay.state),
            digest: layout_digest(&replay.state),
            logs,
        }
    }
}

struct Replay {
    state: MallocState<SimulatedMemory>,
    slots: BTreeMap<String, usize>,
    /// Error of the most recent allocating op, if it failed.
    last_error: Option<AllocError>,
}

impl Replay {
    fn slot(&self, step: usize, slot: &str) -> Result<usize, ReplayError> {
        self.slots
            .get(slot)
            .copied()
            .ok_or_else(|| ReplayError::UnknownSlot {
                step,
                slot: slot.to_string(),
            })
    }

    fn live_slot(&self, step: usize, slot: &str) -> Result<usize, ReplayError> {
        match self.slot(step, slot)? {
            0 => Err(ReplayError::NullSlot {
                step,
                slot: slot.to_string(),
            }),
            ptr => Ok(ptr),
        }
    }

    fn checked_span(&self, step: usize, slot: &str, len: usize) -> Result<usize, ReplayError> {
        let ptr = self.live_slot(step, slot)?;
        let capacity = self.state.usable_size(ptr);
        if len > capacity {
            return Err(ReplayError::OutOfBounds {
                step,
                slot: slot.to_string(),
                len,
                capacity,
            });
        }
        Ok(ptr)
    }

    fn record(&mut self, slot: &str, result: Result<usize, AllocError>, keep_on_error: bool) {
        match result {
            Ok(ptr) => {
                self.slots.insert(slot.to_string(), ptr);
                self.last_error = None;
            }
            Err(err) => {
                if !keep_on_error {
                    self.slots.insert(slot.to_string(), 0);
                }
                self.last_error = Some(err);
            }
        }
    }

    fn apply(&mut self, step: usize, op: &Op) -> Result<(), ReplayError> {
        match op {
            Op::Malloc { slot, len } => {
                let result = self.state.malloc(*len);
                self.record(slot, result, false);
            }
            Op::Calloc { slot, count, size } => {
                let result = self.state.calloc(*count, *size);
                self.record(slot, result, false);
            }
            Op::Realloc { slot, len } => {
                let old = self.slots.get(slot).copied().unwrap_or(0);
                let result = self.state.realloc(old, *len);
                self.record(slot, result, true);
            }
            Op::Free { slot } => {
                let ptr = self.slot(step, slot)?;
                self.state.free(ptr);
                self.slots.insert(slot.clone(), 0);
            }
            Op::Write { slot, byte, len } => {
                let ptr = self.checked_span(step, slot, *len)?;
                self.state.memory_mut().fill(ptr, *byte, *len);
            }
            Op::FailNext { call } => {
                let memory = self.state.memory_mut();
                match call {
                    FaultKind::Extend => memory.fail_next_extend(),
                    FaultKind::Map => memory.fail_next_map(),
                    FaultKind::Unmap => memory.fail_next_unmap(),
                    FaultKind::Remap => memory.fail_next_remap(),
                }
            }
            Op::Expect(expectation) => self.check(step, expectation)?,
        }
        Ok(())
    }

    fn check(&self, step: usize, expectation: &Expectation) -> Result<(), ReplayError> {
        let fail = |detail: String| Err(ReplayError::Expectation { step, detail });
        match expectation {
            Expectation::Null { slot } => {
                let ptr = self.slot(step, slot)?;
                if ptr != 0 {
                    return fail(format!("'{slot}' holds {ptr:#x}, expected null"));
                }
            }
            Expectation::Failed => {
                if self.last_error.is_none() {
                    return fail("previous allocation succeeded".to_string());
                }
            }
            Expectation::Path { slot, path } => {
                let ptr = self.live_slot(step, slot)?;
                let expected = AllocPath::from(*path);
                let found = self.state.path_of(ptr);
                if found != Some(expected) {
                    return fail(format!(
                        "'{slot}' is on {found:?}, expected {}",
                        expected.as_str()
                    ));
                }
            }
            Expectation::Pattern {
                slot,
                byte,
                from,
                len,
            } => {
                let ptr = self.checked_span(step, slot, from.saturating_add(*len))?;
                let bytes = self.state.memory().read(ptr + from, *len);
                if let Some(i) = bytes.iter().position(|b| b != byte) {
                    return fail(format!(
                        "'{slot}' byte {} is {:#04x}, expected {byte:#04x}",
                        from + i,
                        bytes[i]
                    ));
                }
            }
            Expectation::Offset { slot, offset } => {
                let ptr = self.live_slot(step, slot)?;
                let found = ptr.wrapping_sub(self.state.memory().heap_base());
                if found != *offset {
                    return fail(format!("'{slot}' is at offset {found:#x}, expected {offset:#x}"));
                }
            }
            Expectation::SameAs { slot, other } => {
                let a = self.slot(step, slot)?;
                let b = self.slot(step, other)?;
                if a != b {
                    return fail(format!("'{slot}'={a:#x} but '{other}'={b:#x}"));
                }
            }
            Expectation::BreakExtensions { count } => {
                let found = self.state.memory().extend_count();
                if found != *count {
                    return fail(format!("{found} break extensions, expected {count}"));
                }
            }
            Expectation::LiveMappings { count } => {
                let found = self.state.memory().live_mappings();
                if found != *count {
                    return fail(format!("{found} live mappings, expected {count}"));
                }
            }
            Expectation::Unmaps { count } => {
                let found = self.state.memory().unmap_count();
                if found != *count {
                    return fail(format!("{found} unmaps, expected {count}"));
                }
            }
            Expectation::Heap {
                blocks,
                free_blocks,
            } => {
                let summary = self
                    .state
                    .audit()
                    .map_err(|source| ReplayError::Audit { step, source })?;
                if blocks.is_some_and(|n| n != summary.blocks) {
                    return fail(format!("{} heap blocks, expected {blocks:?}", summary.blocks));
                }
                if free_blocks.is_some_and(|n| n != summary.free_blocks) {
                    return fail(format!(
                        "{} free blocks, expected {free_blocks:?}",
                        summary.free_blocks
                    ));
                }
            }
            Expectation::Audit => {
                self.state
                    .audit()
                    .map_err(|source| ReplayError::Audit { step, source })?;
            }
        }
        Ok(())
    }
}
