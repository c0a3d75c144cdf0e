//! Integration test: structured logs written by replay and workload runs
//! pass schema validation.

use lmem_core::config::CheckMode;
use lmem_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, Outcome, validate_log_file, validate_log_line,
};
use lmem_harness::{FixtureSet, ReplayRunner, Workload};

fn temp_log(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("lmem-{}-{name}.jsonl", std::process::id()))
}

#[test]
fn replay_logs_validate() {
    let set = FixtureSet::from_json(
        r#"{"version":"v1","family":"log","cases":[{"name":"mix","mode":"both","ops":[
            {"op":"malloc","slot":"a","len":64},
            {"op":"malloc","slot":"b","len":70000},
            {"op":"realloc","slot":"a","len":4096},
            {"op":"free","slot":"a"},
            {"op":"free","slot":"b"},
            {"op":"free","slot":"never"}
        ]}]}"#,
    )
    .unwrap();
    let results = ReplayRunner::new("log-test", CheckMode::Checked).run(&set);
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(!result.passed, "freeing an unassigned slot stops the case");

    let events: Vec<&str> = result.logs.iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"alloc"));
    assert!(events.contains(&"realloc_move"));
    assert!(events.contains(&"free"));

    let path = temp_log("replay");
    let mut emitter = LogEmitter::to_file(&path, "log-test").unwrap();
    for entry in result.logs.iter().cloned() {
        emitter.emit_entry(entry).unwrap();
    }
    emitter.emit_entry(result.summary_entry()).unwrap();
    emitter.flush().unwrap();
    drop(emitter);

    let (lines, errors) = validate_log_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(lines, result.logs.len() + 1);
    assert!(errors.is_empty(), "validation errors: {errors:?}");
}

#[test]
fn workload_logs_validate() {
    let (report, logs) = Workload::new(42, 300)
        .with_mode(CheckMode::Compat)
        .with_logging(true)
        .run()
        .unwrap();
    let mut emitter = LogEmitter::to_buffer("workload");
    for entry in logs {
        emitter.emit_entry(entry).unwrap();
    }
    emitter.emit_entry(report.summary_entry()).unwrap();

    let text = String::from_utf8(emitter.into_inner()).unwrap();
    let mut count = 0;
    for (i, line) in text.lines().enumerate() {
        let entry = validate_log_line(line, i + 1)
            .unwrap_or_else(|errs| panic!("line {}: {errs:?}", i + 1));
        if let Some(mode) = entry.mode.as_deref() {
            assert_eq!(mode, "compat");
        }
        count += 1;
    }
    assert!(count > 300, "every step logs at least one record");
}

#[test]
fn failing_case_summary_is_an_error_entry() {
    let set = FixtureSet::from_json(
        r#"{"version":"v1","family":"log","cases":[{"name":"bad","mode":"compat","ops":[
            {"op":"expect","check":"null","slot":"missing"}
        ]}]}"#,
    )
    .unwrap();
    let result = &ReplayRunner::new("t", CheckMode::Compat).run(&set)[0];
    let entry = result.summary_entry();
    assert_eq!(entry.level, LogLevel::Error);
    assert_eq!(entry.outcome, Some(Outcome::Fail));
}

#[test]
fn hand_built_entry_round_trips() {
    let entry = LogEntry::new("lmem::manual::001", LogLevel::Warn, "note")
        .with_case("manual")
        .with_errno(12);
    let line = entry.to_jsonl().unwrap();
    let parsed = validate_log_line(&line, 1).unwrap();
    assert_eq!(parsed.errno, Some(12));
    assert_eq!(parsed.case.as_deref(), Some("manual"));
}
