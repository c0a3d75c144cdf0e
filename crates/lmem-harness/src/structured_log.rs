//! Structured JSONL logs for replay and workload runs.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL record with required and optional fields.
//! - [`LogEntry::from_allocator_record`]: lifts an allocator lifecycle record.
//! - [`LogEmitter`]: writes JSONL lines to any writer.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks.

use std::io::Write;
use std::path::Path;

use lmem_core::config::CheckMode;
use lmem_core::malloc::{AllocatorLogLevel, AllocatorLogRecord};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<AllocatorLogLevel> for LogLevel {
    fn from(level: AllocatorLogLevel) -> Self {
        match level {
            AllocatorLogLevel::Trace => Self::Trace,
            AllocatorLogLevel::Debug => Self::Debug,
            AllocatorLogLevel::Info => Self::Info,
            AllocatorLogLevel::Warn => Self::Warn,
            AllocatorLogLevel::Error => Self::Error,
        }
    }
}

/// Verdict of a case, workload or check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Which harness activity produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Replay,
    Workload,
    Allocator,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamKind>,
    /// `compat` or `checked`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Fixture case or workload name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Payload address, `0x`-prefixed hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// `heap` or `mapped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            stream: None,
            mode: None,
            case: None,
            symbol: None,
            ptr: None,
            size: None,
            path: None,
            decision_id: None,
            outcome: None,
            errno: None,
            details: None,
        }
    }

    /// Lift an allocator lifecycle record. The allocator's own trace id and
    /// decision id are kept so entries join back to the record.
    #[must_use]
    pub fn from_allocator_record(record: &AllocatorLogRecord, mode: CheckMode) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event)
            .with_stream(StreamKind::Allocator)
            .with_mode(mode)
            .with_details(serde_json::json!({
                "outcome": record.outcome,
                "info": record.details,
            }));
        entry.symbol = Some(record.symbol.to_string());
        entry.ptr = record.ptr.map(|ptr| format!("{ptr:#x}"));
        entry.size = record.size;
        entry.path = record.path.map(|path| path.as_str().to_string());
        entry.decision_id = Some(record.decision_id);
        entry
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_stream(mut self, stream: StreamKind) -> Self {
        self.stream = Some(stream);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = Some(mode.as_str().to_string());
        self
    }

    #[must_use]
    pub fn with_case(mut self, case: impl Into<String>) -> Self {
        self.case = Some(case.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// Writes structured JSONL log entries.
pub struct LogEmitter<W: Write> {
    writer: W,
    seq: u64,
    run_id: String,
}

impl LogEmitter<std::io::BufWriter<std::fs::File>> {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(std::io::BufWriter::new(file), run_id))
    }
}

impl LogEmitter<Vec<u8>> {
    /// Create an emitter that writes to an in-memory buffer.
    #[must_use]
    pub fn to_buffer(run_id: &str) -> Self {
        Self::new(Vec::new(), run_id)
    }
}

impl<W: Write> LogEmitter<W> {
    #[must_use]
    pub fn new(writer: W, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("lmem::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare entry with a generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event).with_run(&self.run_id);
        self.write_line(&entry)?;
        Ok(entry)
    }

    /// Emit a fully-populated entry, filling in the trace and run ids when
    /// absent.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        self.write_line(&entry)
    }

    fn write_line(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// The underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];
const MODES: [&str; 2] = ["compat", "checked"];
const OUTCOMES: [&str; 4] = ["pass", "fail", "skip", "error"];
const STREAMS: [&str; 3] = ["replay", "workload", "allocator"];
const PATHS: [&str; 2] = ["heap", "mapped"];

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let error = |field: &str, message: String| LogValidationError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![error("<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![error("<root>", "expected JSON object".to_string())]);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(error(field, "required field missing".to_string()));
        }
    }

    for (field, allowed) in [
        ("level", &LEVELS[..]),
        ("mode", &MODES[..]),
        ("outcome", &OUTCOMES[..]),
        ("stream", &STREAMS[..]),
        ("path", &PATHS[..]),
    ] {
        if let Some(found) = obj.get(field).and_then(|v| v.as_str()) {
            if !allowed.contains(&found) {
                errors.push(error(field, format!("invalid {field}: '{found}'")));
            }
        }
    }

    if let Some(ptr) = obj.get("ptr").and_then(|v| v.as_str()) {
        let hex = ptr.strip_prefix("0x").unwrap_or("");
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            errors.push(error("ptr", format!("ptr must be 0x-prefixed hex, got: '{ptr}'")));
        }
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str()) {
        if !trace_id.starts_with("lmem::") {
            errors.push(error(
                "trace_id",
                format!("trace_id should start with 'lmem::', got: '{trace_id}'"),
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value)
        .map_err(|e| vec![error("<deserialization>", format!("failed to deserialize: {e}"))])
}

/// Validate an entire JSONL file.
///
/// Returns the non-empty line count and every validation error found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

/// RFC 3339 UTC timestamp for `secs` since the epoch.
fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

// Days-since-epoch to proleptic Gregorian date (Howard Hinnant's algorithm).
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmem_core::malloc::AllocPath;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("lmem::run-1::001", LogLevel::Info, "case_start");
        let json = entry.to_jsonl().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["trace_id"], "lmem::run-1::001");
        assert_eq!(v["level"], "info");
        assert_eq!(v["event"], "case_start");
        assert!(v.get("mode").is_none(), "unset optionals are omitted");
    }

    #[test]
    fn allocator_record_lifts_into_valid_entry() {
        let record = AllocatorLogRecord {
            decision_id: 7,
            trace_id: "lmem::malloc::malloc::0000000000000007".to_string(),
            level: AllocatorLogLevel::Trace,
            symbol: "malloc",
            event: "alloc",
            ptr: Some(0x10_0020),
            size: Some(24),
            path: Some(AllocPath::Heap),
            outcome: "success",
            details: "heap_grow".to_string(),
        };
        let entry = LogEntry::from_allocator_record(&record, CheckMode::Checked);
        assert_eq!(entry.ptr.as_deref(), Some("0x100020"));
        assert_eq!(entry.path.as_deref(), Some("heap"));
        assert_eq!(entry.mode.as_deref(), Some("checked"));
        assert_eq!(entry.decision_id, Some(7));

        let line = entry.to_jsonl().unwrap();
        let parsed = validate_log_line(&line, 1).expect("lifted entry validates");
        assert_eq!(parsed.event, "alloc");
    }

    #[test]
    fn validate_missing_required_field() {
        let errs = validate_log_line(r#"{"timestamp":"t","trace_id":"lmem::x","event":"e"}"#, 3)
            .unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "level");
        assert_eq!(errs[0].line_number, 3);
    }

    #[test]
    fn validate_rejects_bad_enums_and_ptr() {
        let line = r#"{"timestamp":"t","trace_id":"lmem::x","level":"loud","event":"e","mode":"hardened","path":"stack","ptr":"1234"}"#;
        let errs = validate_log_line(line, 1).unwrap_err();
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["level", "mode", "path", "ptr"]);
    }

    #[test]
    fn validate_invalid_json() {
        let errs = validate_log_line("{not json", 1).unwrap_err();
        assert_eq!(errs[0].field, "<json>");
    }

    #[test]
    fn validate_foreign_trace_id() {
        let errs = validate_log_line(
            r#"{"timestamp":"t","trace_id":"abc","level":"info","event":"e"}"#,
            1,
        )
        .unwrap_err();
        assert_eq!(errs[0].field, "trace_id");
    }

    #[test]
    fn emitter_generates_sequential_trace_ids() {
        let mut emitter = LogEmitter::to_buffer("run-9");
        let first = emitter.emit(LogLevel::Info, "a").unwrap();
        let second = emitter.emit(LogLevel::Info, "b").unwrap();
        assert_eq!(first.trace_id, "lmem::run-9::001");
        assert_eq!(second.trace_id, "lmem::run-9::002");

        let text = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for (i, line) in lines.iter().enumerate() {
            validate_log_line(line, i + 1).unwrap();
        }
    }

    #[test]
    fn timestamps_are_calendar_correct() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2024-02-29T12:34:56Z, a leap day.
        assert_eq!(format_utc(1_709_210_096, 5), "2024-02-29T12:34:56.005Z");
        assert_eq!(format_utc(951_782_400, 0), "2000-02-29T00:00:00.000Z");
    }
}
