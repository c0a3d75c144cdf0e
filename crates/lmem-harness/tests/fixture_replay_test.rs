//! Integration test: every checked-in fixture replays cleanly in both modes.

use std::path::{Path, PathBuf};

use lmem_core::config::CheckMode;
use lmem_harness::{FixtureSet, ReplayRunner};

fn workspace_root() -> PathBuf {
    let manifest = env!("CARGO_MANIFEST_DIR");
    Path::new(manifest)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn load_fixtures() -> Vec<FixtureSet> {
    let dir = workspace_root().join("tests/fixtures");
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .unwrap_or_else(|err| panic!("reading {}: {err}", dir.display()))
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|path| {
            FixtureSet::from_file(path)
                .unwrap_or_else(|err| panic!("parsing {}: {err}", path.display()))
        })
        .collect()
}

#[test]
fn fixture_directory_covers_each_family() {
    let families: Vec<String> = load_fixtures().into_iter().map(|set| set.family).collect();
    for family in [
        "malloc/heap",
        "malloc/mapped",
        "malloc/realloc",
        "malloc/calloc",
        "malloc/faults",
    ] {
        assert!(
            families.iter().any(|f| f == family),
            "no fixture set for {family}"
        );
    }
}

#[test]
fn all_fixtures_pass_in_both_modes() {
    let sets = load_fixtures();
    for mode in [CheckMode::Compat, CheckMode::Checked] {
        let runner = ReplayRunner::new("fixture-test", mode);
        let mut ran = 0;
        for set in &sets {
            for result in runner.run(set) {
                ran += 1;
                assert!(
                    result.passed,
                    "{}/{} failed: {}",
                    set.family,
                    result.case_name,
                    result.failure.as_deref().unwrap_or("")
                );
                assert_eq!(result.digest.len(), 64);
            }
        }
        assert!(ran >= 15, "only {ran} cases ran in {} mode", mode.as_str());
    }
}

#[test]
fn mode_specific_cases_only_run_in_their_mode() {
    let sets = load_fixtures();
    let realloc = sets
        .iter()
        .find(|set| set.family == "malloc/realloc")
        .expect("realloc fixtures present");

    let compat: Vec<String> = ReplayRunner::new("m", CheckMode::Compat)
        .run(realloc)
        .into_iter()
        .map(|r| r.case_name)
        .collect();
    let checked: Vec<String> = ReplayRunner::new("m", CheckMode::Checked)
        .run(realloc)
        .into_iter()
        .map(|r| r.case_name)
        .collect();

    assert!(compat.iter().any(|n| n == "compat_copies_requested_length"));
    assert!(!checked.iter().any(|n| n == "compat_copies_requested_length"));
    assert!(checked.iter().any(|n| n == "checked_copies_old_payload_only"));
    assert!(!compat.iter().any(|n| n == "checked_copies_old_payload_only"));
}

#[test]
fn replay_is_deterministic() {
    let sets = load_fixtures();
    let runner = ReplayRunner::new("det", CheckMode::Compat);
    for set in &sets {
        let first: Vec<String> = runner.run(set).into_iter().map(|r| r.digest).collect();
        let second: Vec<String> = runner.run(set).into_iter().map(|r| r.digest).collect();
        assert_eq!(first, second, "{} replay digests differ", set.family);
    }
}
