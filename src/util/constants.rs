// Casetrail - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.
// Analysis thresholds (gap sizes, burst widths, indicator lists) are NOT
// defined here: they only ever come from config.toml.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "Casetrail";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "Casetrail";

/// Current application version (updated by release script).
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Timestamps
// =============================================================================

/// The one accepted spelling of an event timestamp (UTC, second precision).
/// Parsing and formatting both use this, so parse -> format is the identity
/// on every accepted input.
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Number of leading hex characters of the SHA-256 used as an event id.
pub const EVENT_ID_HEX_LEN: usize = 16;

/// Separator placed between canonical fields before hashing an event id.
/// ASCII unit separator: cannot appear in a canonical timestamp, source or type.
pub const EVENT_ID_FIELD_SEPARATOR: char = '\u{1f}';

// =============================================================================
// Ingestion limits
// =============================================================================

/// Maximum size of a single normalised event file accepted for ingestion.
pub const MAX_EVENT_FILE_SIZE: u64 = 512 * 1024 * 1024; // 512 MB

/// Maximum number of schema violations kept verbatim in diagnostics.
/// Further violations are still counted but not individually retained.
pub const MAX_RECORDED_SCHEMA_VIOLATIONS: usize = 10_000;

/// Maximum length of a record excerpt kept in a schema violation.
pub const SCHEMA_VIOLATION_EXCERPT_LEN: usize = 200;

// =============================================================================
// Hashing
// =============================================================================

/// Files at or above this size are hashed through a memory map instead of
/// a buffered stream.
pub const DEFAULT_MMAP_THRESHOLD: u64 = 64 * 1024 * 1024; // 64 MB

/// Buffer size for streamed hashing.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024; // 64 KB

/// Retry limits for transient I/O errors while hashing.
pub const HASH_MAX_RETRIES: u32 = 3;
pub const HASH_RETRY_DELAYS_MS: [u64; 3] = [50, 100, 200];

// =============================================================================
// Worker pool
// =============================================================================

/// Default number of worker threads. 0 means auto-detect (CPU cores).
pub const DEFAULT_WORKER_THREADS: usize = 0;

/// Hard upper bound on configured worker threads.
pub const MAX_WORKER_THREADS: usize = 256;

// =============================================================================
// Rule limits
// =============================================================================

/// Maximum number of rules in one registry.
pub const MAX_RULES: usize = 256;

/// Maximum number of malware indicators per rule (inline + file).
pub const MAX_INDICATORS_PER_RULE: usize = 100_000;

/// Maximum size of an indicator list file.
pub const MAX_INDICATOR_FILE_SIZE: u64 = 16 * 1024 * 1024; // 16 MB

/// Minimum length of an indicator after trimming. Single characters would
/// match nearly every substring.
pub const MIN_INDICATOR_LEN: usize = 3;

/// Upper bound for any configured time span (window, gap, tolerance): 10 years.
pub const MAX_CONFIGURED_SPAN_SECS: i64 = 10 * 366 * 24 * 3_600;

/// Bound for the configured UTC offset used for local-hour rules (+/- 14 h).
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// How many evidence items a burst window may reference before the rule
/// is considered misbehaving. Each window finding lists every contributing id.
pub const MAX_EVIDENCE_REFS_PER_FINDING: usize = 100_000;

// =============================================================================
// Evidence discovery
// =============================================================================

/// Maximum directory recursion depth when recording an evidence tree.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Hard upper bound on max depth.
pub const ABSOLUTE_MAX_DEPTH: usize = 64;

/// Maximum number of files recorded from one evidence tree.
pub const DEFAULT_MAX_EVIDENCE_FILES: usize = 100_000;

/// Default exclude patterns for evidence discovery. Only tool droppings that
/// are never evidence; everything else is included by default.
pub const DEFAULT_EVIDENCE_EXCLUDE_PATTERNS: &[&str] = &[".DS_Store", "Thumbs.db"];

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

// =============================================================================
// Files
// =============================================================================

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Default manifest file name (JSON Lines, append-only).
pub const MANIFEST_FILE_NAME: &str = "manifest.jsonl";

/// Export file names written by the `Reported` stage.
pub const FINDINGS_FILE_NAME: &str = "findings.json";
pub const TIMELINE_FILE_NAME: &str = "timeline.json";
pub const TIMELINE_CSV_FILE_NAME: &str = "timeline.csv";
pub const DIAGNOSTICS_FILE_NAME: &str = "diagnostics.json";

/// Exports are written as `.<name>.partial` and renamed once recorded.
pub const EXPORT_STAGING_SUFFIX: &str = ".partial";

// =============================================================================
// Exit codes
// =============================================================================

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_USAGE_ERROR: i32 = 1;
pub const EXIT_DEGRADED: i32 = 2;
pub const EXIT_ABORTED: i32 = 3;
