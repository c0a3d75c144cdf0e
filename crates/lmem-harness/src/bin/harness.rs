//! CLI entrypoint for the lmem harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use lmem_core::config::CheckMode;
use lmem_harness::structured_log::{LogEmitter, LogEntry, validate_log_file};
use lmem_harness::{FixtureSet, ReplayRunner, Workload};

/// Replay, workload and log tooling for lmem.
#[derive(Debug, Parser)]
#[command(name = "lmem-harness")]
#[command(about = "Fixture replay and workload harness for the lmem allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay fixture scripts against the allocator over simulated memory.
    Replay {
        /// Fixture JSON file, or a directory of them.
        #[arg(long)]
        fixture: PathBuf,
        /// Check mode to replay under (compat, checked, or both).
        #[arg(long, default_value = "both")]
        mode: String,
        /// Optional JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run a seeded random workload and audit the heap after every step.
    Workload {
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        /// Check mode (compat or checked).
        #[arg(long, default_value = "compat")]
        mode: String,
        /// Serve every request from the heap list.
        #[arg(long)]
        no_mmap: bool,
        /// Optional JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn fixture_paths(fixture: &Path) -> std::io::Result<Vec<PathBuf>> {
    if fixture.is_file() {
        return Ok(vec![fixture.to_path_buf()]);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(fixture)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    Ok(paths)
}

fn modes(mode: &str) -> Vec<CheckMode> {
    if mode.eq_ignore_ascii_case("both") {
        vec![CheckMode::Compat, CheckMode::Checked]
    } else {
        vec![CheckMode::from_str_loose(mode)]
    }
}

fn write_log(path: &Path, run_id: &str, entries: Vec<LogEntry>) -> std::io::Result<()> {
    let mut emitter = LogEmitter::to_file(path, run_id)?;
    for entry in entries {
        emitter.emit_entry(entry)?;
    }
    emitter.flush()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay { fixture, mode, log } => {
            let mut sets = Vec::new();
            for path in fixture_paths(&fixture)? {
                match FixtureSet::from_file(&path) {
                    Ok(set) => sets.push(set),
                    Err(err) => eprintln!("Skipping {}: {}", path.display(), err),
                }
            }
            if sets.is_empty() {
                return Err(format!("No fixture JSON files found at {}", fixture.display()).into());
            }

            let mut entries = Vec::new();
            let mut results = Vec::new();
            for mode in modes(&mode) {
                let runner = ReplayRunner::new("replay", mode);
                for set in &sets {
                    for result in runner.run(set) {
                        let status = if result.passed { "PASS" } else { "FAIL" };
                        eprintln!("[{status}] {}/{}", set.family, result.case_name);
                        if let Some(failure) = &result.failure {
                            eprintln!("       {failure}");
                        }
                        entries.extend(result.logs.iter().cloned());
                        entries.push(result.summary_entry());
                        results.push(result);
                    }
                }
            }

            if let Some(path) = log {
                write_log(&path, "replay", entries)?;
            }
            println!("{}", serde_json::to_string_pretty(&results)?);

            let failed = results.iter().filter(|r| !r.passed).count();
            eprintln!("{} cases, {failed} failed", results.len());
            if failed > 0 {
                return Err(format!("{failed} fixture case(s) failed").into());
            }
        }
        Command::Workload {
            seed,
            steps,
            mode,
            no_mmap,
            log,
        } => {
            let workload = Workload::new(seed, steps)
                .with_mode(CheckMode::from_str_loose(&mode))
                .with_mmap(!no_mmap)
                .with_logging(log.is_some());
            let (report, mut entries) = workload.run()?;
            if let Some(path) = log {
                entries.push(report.summary_entry());
                write_log(&path, &format!("workload-{seed:016x}"), entries)?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                return Err(format!("{} invalid log field(s)", errors.len()).into());
            }
        }
    }

    Ok(())
}
