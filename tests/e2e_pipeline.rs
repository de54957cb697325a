// Casetrail - tests/e2e_pipeline.rs
//
// End-to-end tests for custody, analysis and timeline reconstruction.
//
// These tests copy the fixture evidence into a temporary case directory and
// drive the real ledger, the real config loader and the real pipeline
// against it: real files, real SHA-256, real manifest appends. The fixtures
// themselves are never modified.

use casetrail::app::custody::IntegrityLedger;
use casetrail::app::pipeline::{
    self, AbortCause, Pipeline, PipelineState, RunOptions, RunOutcome, RunStatus,
};
use casetrail::core::discovery::{discover_evidence, DiscoveryConfig};
use casetrail::core::manifest::{IntegrityViolation, Stage};
use casetrail::core::model::Severity;
use casetrail::core::rules::{ActivityGapRule, Rule, UnattestedOriginRule};
use casetrail::platform::config::{load_config, AppConfig};
use casetrail::util::constants;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

const EVENT_FIXTURES: [&str; 3] = ["sms.json", "calls.json", "apps.json"];

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn fixture_config() -> AppConfig {
    let (config, warnings) = load_config(&fixture("config.toml"));
    assert!(warnings.is_empty(), "fixture config warnings: {warnings:?}");
    config
}

/// A case directory holding copies of the event fixtures.
struct Case {
    dir: TempDir,
    events: Vec<PathBuf>,
}

impl Case {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let evidence = dir.path().join("evidence");
        fs::create_dir(&evidence).expect("mkdir evidence");
        let events = EVENT_FIXTURES
            .iter()
            .map(|name| {
                let dest = evidence.join(name);
                fs::copy(fixture(name), &dest).expect("copy fixture");
                dest
            })
            .collect();
        Self { dir, events }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn ledger(&self) -> IntegrityLedger {
        IntegrityLedger::open(&self.path("manifest.jsonl"), constants::DEFAULT_MMAP_THRESHOLD)
            .expect("open ledger")
    }

    /// A ledger with every event file recorded at `stage`.
    fn recorded_ledger(&self, pipeline: &Pipeline, stage: Stage) -> IntegrityLedger {
        let mut ledger = self.ledger();
        ledger
            .record_all(&self.events, stage, pipeline.pool())
            .expect("record evidence");
        ledger
    }

    fn options(&self, out: &str) -> RunOptions {
        RunOptions {
            output_dir: Some(self.path(out)),
            write_csv: true,
            ..Default::default()
        }
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read export")).expect("parse export")
}

// =============================================================================
// Full run
// =============================================================================

#[test]
fn e2e_full_run_produces_verified_reports() {
    let case = Case::new();
    let pipeline = Pipeline::new(&fixture_config()).unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::Ingest);

    let outcome = pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &case.options("out"))
        .unwrap();
    assert_eq!(outcome.status(), RunStatus::Success);
    let RunOutcome::Completed(bundle) = outcome else {
        panic!("expected a completed run");
    };

    // One malformed timestamp in sms.json, one unknown source in calls.json.
    assert_eq!(bundle.diagnostics.schema_violations_total, 2);

    let rule_ids: Vec<&str> = bundle.findings.iter().map(|f| f.rule_id()).collect();
    assert_eq!(rule_ids, vec!["known-spyware", "delete-recreate", "late-call-burst"]);
    assert_eq!(bundle.findings[0].severity(), Severity::High);
    assert!(bundle.findings[0].explanation().contains("\"com.suspicious.app\""));
    assert_eq!(bundle.findings[2].evidence_refs().len(), 3);

    // 10 valid records, one exact duplicate collapsed.
    assert_eq!(bundle.timeline_stats.event_entries, 9);
    assert_eq!(bundle.timeline_stats.collapsed_duplicates, 1);
    assert_eq!(bundle.timeline_stats.finding_entries, 3);
    assert_eq!(bundle.timeline_stats.gap_markers, 3);

    // Exports exist, are recorded at post-analysis, and the manifest holds
    // ingest + post-extraction for each input plus one record per export.
    let out = case.path("out");
    for name in [
        constants::FINDINGS_FILE_NAME,
        constants::TIMELINE_FILE_NAME,
        constants::TIMELINE_CSV_FILE_NAME,
        constants::DIAGNOSTICS_FILE_NAME,
    ] {
        assert!(out.join(name).is_file(), "missing export {name}");
    }
    assert_eq!(fs::read_dir(&out).unwrap().count(), 4, "no staging files left behind");
    assert_eq!(bundle.exports.len(), 4);
    let manifest_lines = fs::read_to_string(case.path("manifest.jsonl")).unwrap();
    assert_eq!(manifest_lines.lines().count(), 3 + 3 + 4);

    let reopened = case.ledger();
    for export in &bundle.exports {
        assert!(reopened.verify(Path::new(&export.file_path), Stage::PostAnalysis).is_ok());
    }

    let diagnostics = read_json(&out.join(constants::DIAGNOSTICS_FILE_NAME));
    assert_eq!(diagnostics["status"], "success");
    assert_eq!(diagnostics["finding_stats"]["total"], 3);
}

#[test]
fn e2e_timeline_orders_sms_gap_then_call() {
    let case = Case::new();
    let pipeline = Pipeline::new(&fixture_config()).unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::Ingest);
    pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &case.options("out"))
        .unwrap();

    let timeline = read_json(&case.path("out").join(constants::TIMELINE_FILE_NAME));
    let entries = timeline.as_array().expect("timeline is an array");
    let kinds: Vec<&str> = entries[..4].iter().map(|e| e["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["event", "event", "gap", "event"]);

    assert_eq!(entries[0]["timestamp"], "2024-01-01 09:00:00");
    assert_eq!(entries[1]["timestamp"], "2024-01-01 09:00:05");
    assert_eq!(entries[1]["duplicate_count"], 2);
    assert_eq!(entries[3]["payload"]["source"], "CALL");

    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry["sequence_index"], i + 1);
    }
}

// =============================================================================
// Integrity failures
// =============================================================================

#[test]
fn e2e_single_byte_flip_aborts_without_timeline() {
    let case = Case::new();
    let pipeline = Pipeline::new(&fixture_config()).unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::Ingest);

    let calls = &case.events[1];
    let mut bytes = fs::read(calls).unwrap();
    bytes[40] ^= 0x01;
    fs::write(calls, bytes).unwrap();

    let outcome = pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &case.options("out"))
        .unwrap();
    assert_eq!(outcome.status().exit_code(), constants::EXIT_ABORTED);
    let RunOutcome::Aborted(report) = outcome else {
        panic!("expected an aborted run");
    };
    assert_eq!(report.stage, PipelineState::Verified);
    match report.cause {
        AbortCause::Integrity(IntegrityViolation::DigestMismatch { file_path, stage, .. }) => {
            assert!(file_path.ends_with("calls.json"));
            assert_eq!(stage, Stage::PostExtraction);
        }
        other => panic!("unexpected cause: {other:?}"),
    }
    assert!(!case.path("out").exists(), "no report may be written");

    // Only the ingest records exist: nothing was appended by the failed run.
    assert_eq!(case.ledger().manifest().len(), 3);
}

#[test]
fn e2e_unrecorded_evidence_aborts() {
    let case = Case::new();
    let pipeline = Pipeline::new(&fixture_config()).unwrap();
    let mut ledger = case.ledger();

    let outcome = pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &RunOptions::default())
        .unwrap();
    let RunOutcome::Aborted(report) = outcome else {
        panic!("expected an aborted run");
    };
    assert!(matches!(
        report.cause,
        AbortCause::Integrity(IntegrityViolation::Unrecorded { .. })
    ));
}

// =============================================================================
// Determinism and degradation
// =============================================================================

#[test]
fn e2e_reruns_are_byte_identical() {
    let case = Case::new();
    let pipeline = Pipeline::new(&fixture_config()).unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::Ingest);

    for out in ["run1", "run2"] {
        let outcome = pipeline
            .run(pipeline::ingest(&case.events), &mut ledger, &case.options(out))
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Success);
    }

    for name in [
        constants::FINDINGS_FILE_NAME,
        constants::TIMELINE_FILE_NAME,
        constants::TIMELINE_CSV_FILE_NAME,
        constants::DIAGNOSTICS_FILE_NAME,
    ] {
        let first = fs::read(case.path("run1").join(name)).unwrap();
        let second = fs::read(case.path("run2").join(name)).unwrap();
        assert_eq!(first, second, "{name} differs between runs");
    }
}

#[test]
fn e2e_failed_rule_degrades_but_completes() {
    let case = Case::new();
    let config = fixture_config();
    let mut rules = config.rules.clone();
    rules.push(Rule::ActivityGap(ActivityGapRule::new("zero-threshold", 0)));
    let pipeline = Pipeline::with_rules(&config, rules).unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::Ingest);

    let outcome = pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &case.options("out"))
        .unwrap();
    assert_eq!(outcome.status(), RunStatus::DegradedSuccess);
    assert_eq!(outcome.status().exit_code(), constants::EXIT_DEGRADED);
    let RunOutcome::Completed(bundle) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(bundle.findings.len(), 3, "other rules still report");
    assert_eq!(bundle.diagnostics.rule_errors[0].rule_id, "zero-threshold");

    let diagnostics = read_json(&case.path("out").join(constants::DIAGNOSTICS_FILE_NAME));
    assert_eq!(diagnostics["status"], "degraded_success");
    assert_eq!(diagnostics["diagnostics"]["rule_errors"][0]["rule_id"], "zero-threshold");
}

// =============================================================================
// Manifest-aware rules and directory recording
// =============================================================================

#[test]
fn e2e_event_files_first_seen_after_extraction_are_flagged() {
    let case = Case::new();
    let config = fixture_config();
    let pipeline = Pipeline::with_rules(
        &config,
        [Rule::UnattestedOrigin(UnattestedOriginRule::new("unattested", Severity::Medium))],
    )
    .unwrap();
    let mut ledger = case.recorded_ledger(&pipeline, Stage::PostExtraction);

    let outcome = pipeline
        .run(pipeline::ingest(&case.events), &mut ledger, &RunOptions::default())
        .unwrap();
    let RunOutcome::Completed(bundle) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(bundle.findings.len(), 3, "one finding per origin file");
    assert!(bundle.findings.iter().all(|f| f.rule_id() == "unattested"));
}

#[test]
fn e2e_record_directory_then_verify() {
    let case = Case::new();
    let evidence = case.path("evidence");
    fs::write(evidence.join(".DS_Store"), "finder droppings").unwrap();
    let (found, warnings) = discover_evidence(&evidence, &DiscoveryConfig::default()).unwrap();
    assert!(warnings.is_empty());
    let paths: Vec<PathBuf> = found.into_iter().map(|f| f.path).collect();
    assert_eq!(paths.len(), 3);

    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let mut ledger = case.ledger();
    ledger.record_all(&paths, Stage::Ingest, &pool).unwrap();
    assert_eq!(ledger.verify_all(&paths, Stage::PostExtraction, &pool).unwrap().len(), 3);

    fs::write(&paths[0], "[]").unwrap();
    let err = ledger.verify_all(&paths, Stage::PostExtraction, &pool).unwrap_err();
    assert_eq!(err.file_path(), paths[0].display().to_string());
}
