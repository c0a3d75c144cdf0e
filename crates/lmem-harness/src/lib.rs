//! Tooling harness for lmem.
//!
//! This crate provides:
//! - Fixtures: JSON scripts of allocator calls with expectations
//! - Replay: run fixture scripts against the allocator over simulated memory
//! - Workloads: seeded random call sequences, audited after every step
//! - Structured logs: JSONL records of allocator lifecycle events

#![forbid(unsafe_code)]

pub mod fixtures;
pub mod runner;
pub mod structured_log;
pub mod workload;

pub use fixtures::{Expectation, FixtureCase, FixtureSet, Op};
pub use runner::{CaseResult, ReplayRunner};
pub use workload::{Workload, WorkloadReport};
