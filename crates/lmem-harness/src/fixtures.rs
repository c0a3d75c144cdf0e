//! Fixture loading and management.
//!
//! A fixture case is a script of allocator calls over named slots. Each slot
//! holds the payload address returned by the last call that targeted it (`0`
//! after a failed allocation or a `free`).

use lmem_core::config::CheckMode;
use lmem_core::malloc::AllocPath;
use serde::{Deserialize, Serialize};

/// Backing store named in a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathLabel {
    Heap,
    Mapped,
}

impl From<PathLabel> for AllocPath {
    fn from(label: PathLabel) -> Self {
        match label {
            PathLabel::Heap => Self::Heap,
            PathLabel::Mapped => Self::Mapped,
        }
    }
}

/// Collaborator request a fixture can make fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Extend,
    Map,
    Unmap,
    Remap,
}

/// One step of a fixture script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Malloc { slot: String, len: usize },
    Calloc { slot: String, count: usize, size: usize },
    /// Resize the block in `slot`; the slot keeps its old address on failure.
    Realloc { slot: String, len: usize },
    Free { slot: String },
    /// Fill the first `len` payload bytes of `slot` with `byte`.
    Write { slot: String, byte: u8, len: usize },
    FailNext { call: FaultKind },
    Expect(Expectation),
}

/// A check against the allocator state at one point of the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Expectation {
    /// The slot holds null.
    Null { slot: String },
    /// The previous allocating op returned an error.
    Failed,
    Path { slot: String, path: PathLabel },
    /// Payload bytes `[from, from + len)` of `slot` all equal `byte`.
    Pattern {
        slot: String,
        byte: u8,
        #[serde(default)]
        from: usize,
        len: usize,
    },
    /// The payload in `slot` sits `offset` bytes above the heap segment base.
    Offset { slot: String, offset: usize },
    /// Two slots hold the same address.
    SameAs { slot: String, other: String },
    /// Number of successful break extensions so far.
    BreakExtensions { count: usize },
    LiveMappings { count: usize },
    Unmaps { count: usize },
    /// Heap list shape; absent fields are not checked.
    Heap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocks: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        free_blocks: Option<usize>,
    },
    /// The heap list passes the structural audit.
    Audit,
}

/// A single fixture script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCase {
    /// Case identifier.
    pub name: String,
    /// What the case demonstrates.
    #[serde(default)]
    pub description: String,
    /// `compat`, `checked` or `both`.
    pub mode: String,
    /// Whether large requests use dedicated mappings.
    #[serde(default = "default_mmap")]
    pub mmap: bool,
    /// Ceiling on the simulated break segment, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_limit: Option<usize>,
    pub ops: Vec<Op>,
}

fn default_mmap() -> bool {
    true
}

impl FixtureCase {
    /// Whether this case runs under `active`.
    #[must_use]
    pub fn runs_in(&self, active: CheckMode) -> bool {
        self.mode.eq_ignore_ascii_case("both") || CheckMode::from_str_loose(&self.mode) == active
    }
}

/// A collection of fixture cases for one behavior family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSet {
    /// Schema version.
    pub version: String,
    /// Behavior family name.
    pub family: String,
    /// Individual test cases.
    pub cases: Vec<FixtureCase>,
}

impl FixtureSet {
    /// Load fixture set from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize fixture set to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load fixture set from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let set = Self::from_json(&content)?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_parse_from_tagged_json() {
        let set = FixtureSet::from_json(
            r#"{
                "version":"v1",
                "family":"malloc/basic",
                "cases":[{"name":"one","mode":"both","ops":[
                    {"op":"malloc","slot":"a","len":24},
                    {"op":"write","slot":"a","byte":7,"len":24},
                    {"op":"fail_next","call":"extend"},
                    {"op":"expect","check":"path","slot":"a","path":"heap"},
                    {"op":"expect","check":"heap","free_blocks":0},
                    {"op":"expect","check":"failed"},
                    {"op":"free","slot":"a"}
                ]}]
            }"#,
        )
        .expect("valid fixture json");

        let case = &set.cases[0];
        assert!(case.mmap, "mmap defaults to on");
        assert_eq!(case.heap_limit, None);
        assert_eq!(
            case.ops[0],
            Op::Malloc {
                slot: "a".into(),
                len: 24
            }
        );
        assert_eq!(case.ops[2], Op::FailNext { call: FaultKind::Extend });
        assert_eq!(
            case.ops[4],
            Op::Expect(Expectation::Heap {
                blocks: None,
                free_blocks: Some(0)
            })
        );
        assert_eq!(case.ops[5], Op::Expect(Expectation::Failed));
    }

    #[test]
    fn mode_selection() {
        let mut case = FixtureCase {
            name: "m".into(),
            description: String::new(),
            mode: "both".into(),
            mmap: true,
            heap_limit: None,
            ops: Vec::new(),
        };
        assert!(case.runs_in(CheckMode::Compat));
        assert!(case.runs_in(CheckMode::Checked));
        case.mode = "checked".into();
        assert!(!case.runs_in(CheckMode::Compat));
        assert!(case.runs_in(CheckMode::Checked));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = FixtureSet::from_json(
            r#"{"version":"v1","family":"x","cases":[{"name":"bad","mode":"both","ops":[{"op":"memalign","slot":"a"}]}]}"#,
        );
        assert!(err.is_err());
    }
}
