// Casetrail - main.rs
//
// Command-line entry point. Handles:
// 1. CLI argument parsing
// 2. Config loading and logging initialisation (debug mode support)
// 3. Dispatch to record / verify / analyze
//
// Exit codes: 0 success, 1 usage or I/O error, 2 degraded success,
// 3 aborted on an integrity violation.

use casetrail::app::custody::IntegrityLedger;
use casetrail::app::pipeline::{self, Pipeline, RunOptions, RunOutcome};
use casetrail::core::discovery;
use casetrail::core::manifest::Stage;
use casetrail::platform::config::{self, AppConfig, PlatformPaths};
use casetrail::util::constants;
use casetrail::util::error::{CasetrailError, ConfigError};
use casetrail::util::logging;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Casetrail - chain-of-custody verification, rule-based analysis and
/// timeline reconstruction for normalised mobile forensic events.
#[derive(Parser, Debug)]
#[command(name = "casetrail", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hash evidence files and append them to the manifest.
    Record {
        /// Files to record.
        files: Vec<PathBuf>,

        /// Record every file under this evidence directory.
        #[arg(long = "dir")]
        dir: Option<PathBuf>,

        /// Stage to record: ingest, post-extraction or post-analysis.
        #[arg(short = 's', long = "stage", default_value = "ingest")]
        stage: Stage,

        /// Manifest file (JSON Lines, append-only).
        #[arg(short = 'm', long = "manifest", default_value = constants::MANIFEST_FILE_NAME)]
        manifest: PathBuf,
    },

    /// Re-hash files and compare them with their baseline records.
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short = 's', long = "stage", default_value = "post-extraction")]
        stage: Stage,

        #[arg(short = 'm', long = "manifest", default_value = constants::MANIFEST_FILE_NAME)]
        manifest: PathBuf,
    },

    /// Verify, analyse and build the timeline for a set of event files.
    Analyze {
        /// Normalised event files (JSON arrays of records).
        #[arg(required = true)]
        events: Vec<PathBuf>,

        #[arg(short = 'm', long = "manifest", default_value = constants::MANIFEST_FILE_NAME)]
        manifest: PathBuf,

        /// Additional evidence files to verify during the run.
        #[arg(short = 'e', long = "evidence")]
        evidence: Vec<PathBuf>,

        /// Output directory for findings, timeline and diagnostics.
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,

        /// Also write timeline.csv.
        #[arg(long = "csv")]
        csv: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let (app_config, config_warnings) = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(constants::EXIT_USAGE_ERROR);
        }
    };

    logging::init(
        cli.debug,
        app_config.log_level.as_deref(),
        app_config.log_file.as_deref().map(Path::new),
    );
    tracing::info!(
        version = constants::APP_VERSION,
        debug = cli.debug,
        "Casetrail starting"
    );
    for warning in &config_warnings {
        tracing::warn!(warning = %warning, "Config warning");
    }

    let code = match run(cli.command, app_config, config_warnings) {
        Ok(code) => code,
        Err(CasetrailError::Integrity(v)) => {
            eprintln!("INTEGRITY VIOLATION: {v}");
            constants::EXIT_ABORTED
        }
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            constants::EXIT_USAGE_ERROR
        }
    };
    std::process::exit(code);
}

/// An explicit `--config` must exist; the platform default may not.
fn load_config(explicit: Option<&Path>) -> Result<(AppConfig, Vec<String>), ConfigError> {
    match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
            Ok(config::load_config(path))
        }
        None => Ok(config::load_config(&PlatformPaths::resolve().config_file())),
    }
}

fn run(
    command: Command,
    app_config: AppConfig,
    config_warnings: Vec<String>,
) -> Result<i32, CasetrailError> {
    match command {
        Command::Record {
            files,
            dir,
            stage,
            manifest,
        } => {
            let mut paths = files;
            if let Some(dir) = dir {
                let (found, warnings) = discovery::discover_evidence(&dir, &app_config.discovery)
                    .map_err(CasetrailError::Discovery)?;
                for warning in warnings {
                    eprintln!("warning: {warning}");
                }
                paths.extend(found.into_iter().map(|f| f.path));
            }
            if paths.is_empty() {
                eprintln!("Error: nothing to record (give files or --dir)");
                return Ok(constants::EXIT_USAGE_ERROR);
            }

            let pool = worker_pool(&app_config)?;
            let mut ledger = IntegrityLedger::open(&manifest, app_config.mmap_threshold)?;
            for record in ledger.record_all(&paths, stage, &pool)? {
                println!("{}  {}  {}", record.sha256_digest, record.stage, record.file_path);
            }
            Ok(constants::EXIT_SUCCESS)
        }

        Command::Verify {
            files,
            stage,
            manifest,
        } => {
            let pool = worker_pool(&app_config)?;
            let ledger = IntegrityLedger::open(&manifest, app_config.mmap_threshold)?;
            for record in ledger.verify_all(&files, stage, &pool)? {
                println!("OK  {}  {}", record.sha256_digest, record.file_path);
            }
            Ok(constants::EXIT_SUCCESS)
        }

        Command::Analyze {
            events,
            manifest,
            evidence,
            out,
            csv,
        } => {
            let pipeline = Pipeline::new(&app_config)?;
            let mut ledger = IntegrityLedger::open(&manifest, app_config.mmap_threshold)?;

            let mut case = pipeline::ingest(&events);
            case.diagnostics.config_warnings = config_warnings;

            let options = RunOptions {
                evidence_files: evidence,
                output_dir: out,
                write_csv: csv,
            };
            let outcome = pipeline.run(case, &mut ledger, &options)?;
            let code = outcome.status().exit_code();
            print_outcome(&outcome);
            Ok(code)
        }
    }
}

fn worker_pool(app_config: &AppConfig) -> Result<rayon::ThreadPool, CasetrailError> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(app_config.worker_threads)
        .thread_name(|i| format!("casetrail-worker-{i}"))
        .build()?)
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(bundle) => {
            println!("Status:    {}", bundle.status);
            println!("Events:    {}", bundle.timeline_stats.event_entries);
            println!("Findings:  {}", bundle.findings.len());
            println!("Gaps:      {}", bundle.timeline_stats.gap_markers);
            if bundle.diagnostics.schema_violations_total > 0 {
                println!("Rejected records: {}", bundle.diagnostics.schema_violations_total);
            }
            for file in &bundle.diagnostics.rejected_files {
                println!("Rejected file: {file}");
            }
            for error in &bundle.diagnostics.rule_errors {
                println!("Warning: {error}");
            }
            for record in &bundle.exports {
                println!("Wrote {}  {}", record.sha256_digest, record.file_path);
            }
        }
        RunOutcome::Aborted(report) => {
            eprintln!("ABORTED at {}: {}", report.stage, report.cause);
            eprintln!("No timeline or report was produced.");
        }
    }
}
