// Casetrail - app/pipeline.rs
//
// One analysis run:
//
//   Ingested -> Verified -> Analyzed -> TimelineBuilt -> Reported
//
// Each transition requires the previous one to have succeeded. An integrity
// violation at any point ends the run in Aborted and nothing further is
// produced; exports staged before the violation are removed. A failed rule
// leaves the run in Analyzed (degraded), which may still continue to
// TimelineBuilt.

use crate::app::custody::{ledger_key, IntegrityLedger};
use crate::core::cancel::CancelToken;
use crate::core::diagnostics::Diagnostics;
use crate::core::event_store::{EventStore, EventStoreBuilder};
use crate::core::export::{self, DiagnosticsDocument};
use crate::core::manifest::{HashRecord, IntegrityViolation, Manifest, Stage};
use crate::core::model::Finding;
use crate::core::rules::engine::{Analysis, Cancelled, RuleEngine};
use crate::core::rules::{EvalContext, Rule, RuleRegistry};
use crate::core::summary::{FindingStats, TimelineStats};
use crate::core::timeline::{Timeline, TimelineBuilder};
use crate::platform::config::AppConfig;
use crate::util::constants;
use crate::util::error::{CasetrailError, ExportError};
use chrono::FixedOffset;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// States and outcomes
// =============================================================================

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Ingested,
    Verified,
    Analyzed { degraded: bool },
    TimelineBuilt,
    Reported,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingested => f.write_str("ingested"),
            Self::Verified => f.write_str("verified"),
            Self::Analyzed { degraded: false } => f.write_str("analyzed"),
            Self::Analyzed { degraded: true } => f.write_str("analyzed (degraded)"),
            Self::TimelineBuilt => f.write_str("timeline built"),
            Self::Reported => f.write_str("reported"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Result code of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Completed, but one or more rules failed.
    DegradedSuccess,
    /// Integrity could not be established; no timeline or report.
    Aborted,
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DegradedSuccess => "degraded_success",
            Self::Aborted => "aborted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => constants::EXIT_SUCCESS,
            Self::DegradedSuccess => constants::EXIT_DEGRADED,
            Self::Aborted => constants::EXIT_ABORTED,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Integrity(IntegrityViolation),
    /// The caller's cancel token was set with no integrity failure.
    Cancelled,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integrity(v) => write!(f, "integrity violation: {v}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal failure: the stage that could not be completed and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReport {
    pub stage: PipelineState,
    pub cause: AbortCause,
}

/// Everything a completed run produced.
#[derive(Debug)]
pub struct CaseBundle {
    pub status: RunStatus,
    pub findings: Vec<Arc<Finding>>,
    pub timeline: Timeline,
    pub diagnostics: Diagnostics,
    pub timeline_stats: TimelineStats,
    pub finding_stats: FindingStats,
    /// post-analysis records of the written exports (empty without an
    /// output directory).
    pub exports: Vec<HashRecord>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(CaseBundle),
    Aborted(AbortReport),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed(bundle) => bundle.status,
            Self::Aborted(_) => RunStatus::Aborted,
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// The Event Store for a run plus what happened while building it.
#[derive(Debug)]
pub struct IngestedCase {
    pub store: EventStore,
    /// Every event file named for the run, including rejected ones.
    pub event_files: Vec<PathBuf>,
    /// SHA-256 of the bytes each parsed file was read from.
    pub parsed_digests: Vec<(PathBuf, String)>,
    pub diagnostics: Diagnostics,
}

/// Read every event file into one store. A file that cannot be ingested at
/// all is noted in the diagnostics; bad records inside a file are dropped
/// individually.
pub fn ingest(event_files: &[PathBuf]) -> IngestedCase {
    let mut builder = EventStoreBuilder::new();
    let mut diagnostics = Diagnostics::default();
    let mut parsed_digests = Vec::new();

    for path in event_files {
        match builder.ingest_file(path) {
            Ok(report) => {
                if let Some(digest) = report.sha256_digest {
                    parsed_digests.push((path.clone(), digest));
                }
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Event file rejected");
                diagnostics.rejected_files.push(e.to_string());
            }
        }
    }

    let (store, violations, total) = builder.build();
    diagnostics.schema_violations = violations;
    diagnostics.schema_violations_total = total;

    IngestedCase {
        store,
        event_files: event_files.to_vec(),
        parsed_digests,
        diagnostics,
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Further evidence files verified alongside the event files.
    pub evidence_files: Vec<PathBuf>,
    /// Where exports are written. No exports without it.
    pub output_dir: Option<PathBuf>,
    pub write_csv: bool,
}

// =============================================================================
// Pipeline
// =============================================================================

/// A configured pipeline: the rule table, timeline settings and the
/// bounded worker pool shared by hashing and rule evaluation.
pub struct Pipeline {
    engine: RuleEngine,
    timeline: TimelineBuilder,
    utc_offset: FixedOffset,
    pool: rayon::ThreadPool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("rules", &self.engine.registry().len())
            .field("gap_threshold_secs", &self.timeline.gap_threshold_secs())
            .field("utc_offset", &self.utc_offset)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Pipeline {
    /// Build the rule table and worker pool from configuration.
    pub fn new(config: &AppConfig) -> Result<Self, CasetrailError> {
        Self::with_rules(config, config.rules.iter().cloned())
    }

    /// Like [`Pipeline::new`], with an explicit rule list instead of the
    /// configured one.
    pub fn with_rules(
        config: &AppConfig,
        rules: impl IntoIterator<Item = Rule>,
    ) -> Result<Self, CasetrailError> {
        let mut registry = RuleRegistry::new();
        for rule in rules {
            registry.register(rule)?;
        }

        let mut timeline = TimelineBuilder::new();
        if let Some(secs) = config.gap_threshold_secs {
            timeline = timeline.with_gap_threshold(secs);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("casetrail-worker-{i}"))
            .build()?;

        tracing::debug!(
            rules = registry.len(),
            threads = pool.current_num_threads(),
            "Pipeline configured"
        );

        Ok(Self {
            engine: RuleEngine::new(registry),
            timeline,
            utc_offset: config.utc_offset,
            pool,
        })
    }

    /// The bounded pool, for ledger work outside a run.
    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// Run the pipeline to completion or abort.
    ///
    /// `Err` is reserved for failures that say nothing about the evidence:
    /// an unwritable manifest or output directory, or an output directory
    /// that already holds exports from an earlier run.
    pub fn run(
        &self,
        case: IngestedCase,
        ledger: &mut IntegrityLedger,
        options: &RunOptions,
    ) -> Result<RunOutcome, CasetrailError> {
        self.run_with_cancel(case, ledger, options, &CancelToken::new())
    }

    /// [`Pipeline::run`] with a caller-held cancel token. Integrity failures
    /// set the same token.
    pub fn run_with_cancel(
        &self,
        case: IngestedCase,
        ledger: &mut IntegrityLedger,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, CasetrailError> {
        let IngestedCase {
            store,
            event_files,
            parsed_digests,
            mut diagnostics,
        } = case;
        transition(PipelineState::Ingested);
        tracing::info!(
            events = store.len(),
            rejected_records = diagnostics.schema_violations_total,
            rejected_files = diagnostics.rejected_files.len(),
            "Events ingested"
        );

        if let Some(dir) = &options.output_dir {
            check_export_targets(dir, options.write_csv, ledger.manifest())?;
        }

        let mut custody_files = event_files;
        custody_files.extend(options.evidence_files.iter().cloned());

        // -- Verified --
        // The bytes the events were parsed from must match the baseline,
        // not only the files as they are on disk now.
        let verified = parsed_digests
            .iter()
            .try_for_each(|(path, digest)| {
                ledger
                    .check_digest(path, digest, Stage::PostExtraction)
                    .map(|_| ())
            })
            .map_err(CasetrailError::Integrity)
            .and_then(|()| ledger.attest_all(&custody_files, Stage::PostExtraction, &self.pool));
        match verified {
            Ok(_) => transition(PipelineState::Verified),
            Err(CasetrailError::Integrity(v)) => {
                cancel.cancel();
                return Ok(abort(PipelineState::Verified, AbortCause::Integrity(v)));
            }
            Err(e) => return Err(e),
        }

        // -- Analyzed --
        let analysis = match self.analyze(&store, ledger, &custody_files, cancel) {
            Ok(analysis) => analysis,
            Err(report) => return Ok(abort(report.stage, report.cause)),
        };
        let degraded = analysis.is_degraded();
        transition(PipelineState::Analyzed { degraded });
        diagnostics.rule_errors = analysis.errors;

        // -- TimelineBuilt --
        let timeline = self
            .timeline
            .build(store.in_ingestion_order(), &analysis.findings);
        diagnostics.gap_warnings = timeline.gap_warnings().to_vec();
        transition(PipelineState::TimelineBuilt);

        let status = if degraded {
            RunStatus::DegradedSuccess
        } else {
            RunStatus::Success
        };
        let mut bundle = CaseBundle {
            status,
            timeline_stats: TimelineStats::from_timeline(&timeline),
            finding_stats: FindingStats::from_findings(&analysis.findings),
            findings: analysis.findings,
            timeline,
            diagnostics,
            exports: Vec::new(),
        };

        // -- Reported --
        if let Some(dir) = &options.output_dir {
            match publish_reports(dir, &bundle, options.write_csv, ledger, &self.pool) {
                Ok(records) => bundle.exports = records,
                Err(CasetrailError::Integrity(v)) => {
                    cancel.cancel();
                    return Ok(abort(PipelineState::Reported, AbortCause::Integrity(v)));
                }
                Err(e) => return Err(e),
            }
        }
        transition(PipelineState::Reported);

        tracing::info!(
            status = %bundle.status,
            findings = bundle.findings.len(),
            entries = bundle.timeline.len(),
            "Run complete"
        );
        Ok(RunOutcome::Completed(bundle))
    }

    /// Evaluate the rules while the custody files are hashed again. A
    /// mismatch cancels the rules still in flight.
    fn analyze(
        &self,
        store: &EventStore,
        ledger: &IntegrityLedger,
        custody_files: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<Analysis, AbortReport> {
        let ctx = EvalContext::new(ledger.manifest(), cancel).with_utc_offset(self.utc_offset);
        let (evaluated, rechecked) = self.pool.install(|| {
            rayon::join(
                || self.engine.evaluate(store, &ctx),
                || {
                    let result = ledger.verify_all(custody_files, Stage::PostAnalysis, &self.pool);
                    if result.is_err() {
                        cancel.cancel();
                    }
                    result
                },
            )
        });

        let stage = PipelineState::Analyzed { degraded: false };
        if let Err(v) = rechecked {
            return Err(AbortReport {
                stage,
                cause: AbortCause::Integrity(v),
            });
        }
        evaluated.map_err(|Cancelled| AbortReport {
            stage,
            cause: AbortCause::Cancelled,
        })
    }
}

fn transition(state: PipelineState) {
    tracing::info!(%state, "Pipeline state");
}

fn abort(stage: PipelineState, cause: AbortCause) -> RunOutcome {
    tracing::error!(%stage, %cause, "Run aborted; no timeline or report produced");
    transition(PipelineState::Aborted);
    RunOutcome::Aborted(AbortReport { stage, cause })
}

// =============================================================================
// Reports
// =============================================================================

/// An export written under its staging name, and whether it has been
/// moved to its target yet.
#[derive(Debug)]
struct StagedExport {
    staging: PathBuf,
    target: PathBuf,
    placed: bool,
}

fn export_targets(dir: &Path, write_csv: bool) -> Vec<PathBuf> {
    let mut names = vec![constants::FINDINGS_FILE_NAME, constants::TIMELINE_FILE_NAME];
    if write_csv {
        names.push(constants::TIMELINE_CSV_FILE_NAME);
    }
    names.push(constants::DIAGNOSTICS_FILE_NAME);
    names.into_iter().map(|name| dir.join(name)).collect()
}

/// Refuse an output directory whose export paths already exist on disk or
/// already have manifest records. A new run's exports are never compared
/// against an earlier run's artifacts.
fn check_export_targets(dir: &Path, write_csv: bool, manifest: &Manifest) -> Result<(), ExportError> {
    for target in export_targets(dir, write_csv) {
        if target.symlink_metadata().is_ok() {
            return Err(ExportError::TargetExists { path: target });
        }
        if manifest.baseline(&ledger_key(&target)).is_some() {
            return Err(ExportError::AlreadyRecorded { path: target });
        }
    }
    Ok(())
}

/// Write the exports under staging names, record them under their final
/// names, verify the staged bytes, then move them into place. If any step
/// fails, every staged or placed export of this run is removed.
fn publish_reports(
    dir: &Path,
    bundle: &CaseBundle,
    write_csv: bool,
    ledger: &mut IntegrityLedger,
    pool: &rayon::ThreadPool,
) -> Result<Vec<HashRecord>, CasetrailError> {
    std::fs::create_dir_all(dir).map_err(|e| CasetrailError::Io {
        path: dir.to_path_buf(),
        operation: "create output directory",
        source: e,
    })?;

    let mut staged = Vec::new();
    let result = publish_staged(dir, bundle, write_csv, ledger, pool, &mut staged);
    match &result {
        Ok(records) => {
            tracing::info!(dir = %dir.display(), files = records.len(), "Reports written");
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Reports discarded");
            discard(&staged);
        }
    }
    result
}

fn publish_staged(
    dir: &Path,
    bundle: &CaseBundle,
    write_csv: bool,
    ledger: &mut IntegrityLedger,
    pool: &rayon::ThreadPool,
    staged: &mut Vec<StagedExport>,
) -> Result<Vec<HashRecord>, CasetrailError> {
    stage_reports(dir, bundle, write_csv, staged)?;

    let pairs: Vec<(PathBuf, PathBuf)> = staged
        .iter()
        .map(|s| (s.staging.clone(), s.target.clone()))
        .collect();
    ledger.record_staged(&pairs, Stage::PostAnalysis, pool)?;
    ledger.verify_staged(&pairs, Stage::PostAnalysis, pool)?;

    for export in staged.iter_mut() {
        if export.target.symlink_metadata().is_ok() {
            return Err(ExportError::TargetExists {
                path: export.target.clone(),
            }
            .into());
        }
        std::fs::rename(&export.staging, &export.target).map_err(|e| CasetrailError::Io {
            path: export.target.clone(),
            operation: "move export into place",
            source: e,
        })?;
        export.placed = true;
    }

    let targets: Vec<PathBuf> = staged.iter().map(|s| s.target.clone()).collect();
    Ok(ledger.verify_all(&targets, Stage::PostAnalysis, pool)?)
}

fn stage_reports(
    dir: &Path,
    bundle: &CaseBundle,
    write_csv: bool,
    staged: &mut Vec<StagedExport>,
) -> Result<(), ExportError> {
    stage_export(dir, constants::FINDINGS_FILE_NAME, staged, |w, path| {
        export::export_findings_json(&bundle.findings, w, path).map(|_| ())
    })?;
    stage_export(dir, constants::TIMELINE_FILE_NAME, staged, |w, path| {
        export::export_timeline_json(&bundle.timeline, w, path).map(|_| ())
    })?;
    if write_csv {
        stage_export(dir, constants::TIMELINE_CSV_FILE_NAME, staged, |w, path| {
            export::export_timeline_csv(&bundle.timeline, w, path).map(|_| ())
        })?;
    }

    let document = DiagnosticsDocument {
        status: bundle.status.label(),
        diagnostics: &bundle.diagnostics,
        timeline_stats: &bundle.timeline_stats,
        finding_stats: &bundle.finding_stats,
    };
    stage_export(dir, constants::DIAGNOSTICS_FILE_NAME, staged, |w, path| {
        export::export_json(&document, w, path)
    })
}

/// Write one export to `.<name>.partial` in `dir`. A leftover staging file
/// is an error rather than something to overwrite.
fn stage_export<F>(
    dir: &Path,
    name: &str,
    staged: &mut Vec<StagedExport>,
    write: F,
) -> Result<(), ExportError>
where
    F: FnOnce(&mut BufWriter<File>, &Path) -> Result<(), ExportError>,
{
    let staging = dir.join(format!(".{name}{}", constants::EXPORT_STAGING_SUFFIX));
    let io_err = |e: std::io::Error| ExportError::Io {
        path: staging.clone(),
        source: e,
    };
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .map_err(io_err)?;
    staged.push(StagedExport {
        staging: staging.clone(),
        target: dir.join(name),
        placed: false,
    });

    let mut writer = BufWriter::new(file);
    write(&mut writer, &staging)?;
    writer.write_all(b"\n").map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)
}

/// Remove this run's exports: staging files, and targets already moved
/// into place.
fn discard(staged: &[StagedExport]) {
    for export in staged {
        let path = if export.placed {
            &export.target
        } else {
            &export.staging
        };
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(file = %path.display(), "Export removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "Could not remove export"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Severity;
    use crate::core::rules::{ActivityGapRule, IndicatorRule};
    use std::fs;

    fn config() -> AppConfig {
        AppConfig {
            worker_threads: 2,
            gap_threshold_secs: Some(300),
            ..Default::default()
        }
    }

    fn setup(dir: &Path) -> (PathBuf, IntegrityLedger) {
        let events = dir.join("apps.json");
        fs::write(
            &events,
            r#"[
                {"timestamp": "2024-01-01 09:00:00", "source": "APP", "type": "created", "details": "installed com.suspicious.app"},
                {"timestamp": "2024-01-01 12:00:00", "source": "APP", "type": "modified", "details": "updated com.example.notes"}
            ]"#,
        )
        .unwrap();
        let mut ledger = IntegrityLedger::open(&dir.join("manifest.jsonl"), u64::MAX).unwrap();
        ledger.record(&events, Stage::Ingest).unwrap();
        (events, ledger)
    }

    #[test]
    fn test_successful_run_reports_and_records_exports() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let pipeline = Pipeline::with_rules(
            &config(),
            [Rule::Indicator(IndicatorRule::new("iocs", ["com.suspicious.app"]))],
        )
        .unwrap();
        let options = RunOptions {
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        };

        let outcome = pipeline.run(ingest(&[events]), &mut ledger, &options).unwrap();
        let RunOutcome::Completed(bundle) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(bundle.status, RunStatus::Success);
        assert_eq!(bundle.findings.len(), 1);
        assert_eq!(bundle.findings[0].severity(), Severity::High);
        assert_eq!(bundle.timeline_stats.gap_markers, 1);
        assert_eq!(bundle.exports.len(), 3);
        assert!(bundle.exports.iter().all(|r| r.stage == Stage::PostAnalysis));
        assert!(dir.path().join("out").join(constants::DIAGNOSTICS_FILE_NAME).exists());

        let stages: Vec<Stage> = ledger.manifest().records().iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::Ingest, Stage::PostExtraction, Stage::PostAnalysis, Stage::PostAnalysis, Stage::PostAnalysis]
        );
    }

    #[test]
    fn test_tampered_input_aborts_before_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let case = ingest(&[events.clone()]);
        fs::write(&events, "[]").unwrap();

        let pipeline = Pipeline::new(&config()).unwrap();
        let options = RunOptions {
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        };
        let outcome = pipeline.run(case, &mut ledger, &options).unwrap();
        let RunOutcome::Aborted(report) = outcome else {
            panic!("expected an aborted run");
        };
        assert_eq!(report.stage, PipelineState::Verified);
        assert!(matches!(
            report.cause,
            AbortCause::Integrity(IntegrityViolation::DigestMismatch { .. })
        ));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_misconfigured_rule_degrades_run() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let pipeline = Pipeline::with_rules(
            &config(),
            [
                Rule::ActivityGap(ActivityGapRule::new("broken-gap", 0)),
                Rule::Indicator(IndicatorRule::new("iocs", ["com.suspicious.app"])),
            ],
        )
        .unwrap();
        let outcome = pipeline
            .run(ingest(&[events]), &mut ledger, &RunOptions::default())
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::DegradedSuccess);
        assert_eq!(outcome.status().exit_code(), constants::EXIT_DEGRADED);
        let RunOutcome::Completed(bundle) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(bundle.diagnostics.rule_errors.len(), 1);
        assert_eq!(bundle.diagnostics.rule_errors[0].rule_id, "broken-gap");
        assert_eq!(bundle.findings.len(), 1);
    }

    #[test]
    fn test_cancelled_run_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let pipeline = Pipeline::new(&config()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = pipeline
            .run_with_cancel(ingest(&[events]), &mut ledger, &RunOptions::default(), &cancel)
            .unwrap();
        let RunOutcome::Aborted(report) = outcome else {
            panic!("expected an aborted run");
        };
        assert_eq!(report.cause, AbortCause::Cancelled);
    }

    #[test]
    fn test_duplicate_rule_ids_fail_setup() {
        let rules = [
            Rule::ActivityGap(ActivityGapRule::new("gap", 60)),
            Rule::ActivityGap(ActivityGapRule::new("gap", 120)),
        ];
        let err = Pipeline::with_rules(&config(), rules).unwrap_err();
        assert!(matches!(err, CasetrailError::Registry(_)));
    }

    #[test]
    fn test_existing_reports_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(out.join(constants::FINDINGS_FILE_NAME), "[]").unwrap();

        let pipeline = Pipeline::new(&config()).unwrap();
        let options = RunOptions {
            output_dir: Some(out),
            ..Default::default()
        };
        let before = ledger.manifest().len();
        let err = pipeline.run(ingest(&[events]), &mut ledger, &options).unwrap_err();
        assert!(matches!(err, CasetrailError::Export(ExportError::TargetExists { .. })));
        assert_eq!(ledger.manifest().len(), before);
    }

    #[test]
    fn test_reused_output_path_is_refused_before_any_record() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let out = dir.path().join("out");
        let options = RunOptions {
            output_dir: Some(out.clone()),
            ..Default::default()
        };

        let first = Pipeline::new(&config()).unwrap();
        let outcome = first.run(ingest(&[events.clone()]), &mut ledger, &options).unwrap();
        assert_eq!(outcome.status(), RunStatus::Success);
        fs::remove_dir_all(&out).unwrap();

        // Different findings would hash differently from the first run's
        // exports; the run must not be reported as tampering.
        let second = Pipeline::with_rules(
            &config(),
            [Rule::Indicator(IndicatorRule::new("iocs", ["com.suspicious.app"]))],
        )
        .unwrap();
        let before = ledger.manifest().len();
        let err = second.run(ingest(&[events]), &mut ledger, &options).unwrap_err();
        assert!(matches!(err, CasetrailError::Export(ExportError::AlreadyRecorded { .. })));
        assert_eq!(ledger.manifest().len(), before);
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_publish_leaves_no_exports() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        // A findings baseline with other content makes recording conflict.
        let findings = out.join(constants::FINDINGS_FILE_NAME);
        fs::write(&findings, "x").unwrap();
        ledger.record(&findings, Stage::Ingest).unwrap();
        fs::remove_file(&findings).unwrap();

        let pipeline = Pipeline::new(&config()).unwrap();
        let outcome = pipeline
            .run(ingest(&[events]), &mut ledger, &RunOptions::default())
            .unwrap();
        let RunOutcome::Completed(bundle) = outcome else {
            panic!("expected a completed run");
        };

        let before = ledger.manifest().len();
        let err = publish_reports(&out, &bundle, true, &mut ledger, pipeline.pool()).unwrap_err();
        assert!(matches!(
            err,
            CasetrailError::Integrity(IntegrityViolation::DigestMismatch { .. })
        ));
        assert_eq!(ledger.manifest().len(), before);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_parsed_bytes_must_match_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let original = fs::read(&events).unwrap();
        fs::write(
            &events,
            r#"[{"timestamp": "2024-01-01 10:00:00", "source": "APP", "type": "deleted", "details": "removed com.suspicious.app"}]"#,
        )
        .unwrap();
        let case = ingest(&[events.clone()]);
        fs::write(&events, original).unwrap();

        let pipeline = Pipeline::new(&config()).unwrap();
        let outcome = pipeline.run(case, &mut ledger, &RunOptions::default()).unwrap();
        let RunOutcome::Aborted(report) = outcome else {
            panic!("expected an aborted run");
        };
        assert_eq!(report.stage, PipelineState::Verified);
        assert!(matches!(
            report.cause,
            AbortCause::Integrity(IntegrityViolation::DigestMismatch { .. })
        ));
        assert_eq!(ledger.manifest().len(), 1);
    }

    #[test]
    fn test_tampering_during_analysis_cancels_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut ledger) = setup(dir.path());
        let pipeline = Pipeline::with_rules(
            &config(),
            [Rule::Indicator(IndicatorRule::new("iocs", ["com.suspicious.app"]))],
        )
        .unwrap();
        ledger
            .attest_all(&[events.clone()], Stage::PostExtraction, pipeline.pool())
            .unwrap();
        let case = ingest(&[events.clone()]);
        fs::write(&events, "[]").unwrap();

        let cancel = CancelToken::new();
        let err = pipeline
            .analyze(&case.store, &ledger, &[events], &cancel)
            .unwrap_err();
        assert_eq!(err.stage, PipelineState::Analyzed { degraded: false });
        assert!(matches!(
            err.cause,
            AbortCause::Integrity(IntegrityViolation::DigestMismatch { .. })
        ));
        assert!(cancel.is_cancelled());
    }
}
