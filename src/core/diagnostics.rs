// Casetrail - core/diagnostics.rs
//
// Non-fatal problems collected during a run and returned alongside the
// output. Nothing here aborts anything: degradation has to be visible in
// the exported bundle rather than silent.

use crate::core::timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// =============================================================================
// Schema violations
// =============================================================================

/// Why one input record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaViolationKind {
    /// The array element is not a JSON object.
    NotAnObject,
    /// A required field is absent.
    MissingField { field: &'static str },
    /// A field is present but is not a string.
    WrongFieldType { field: &'static str },
    /// The timestamp is unparseable or not canonically spelled.
    InvalidTimestamp { raw: String, reason: String },
    /// `source` is not SMS, CALL, MEDIA or APP.
    UnknownSource { raw: String },
    /// `type` is not one of the known event types.
    UnknownType { raw: String },
}

impl fmt::Display for SchemaViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "record is not a JSON object"),
            Self::MissingField { field } => write!(f, "missing required field '{field}'"),
            Self::WrongFieldType { field } => write!(f, "field '{field}' must be a string"),
            Self::InvalidTimestamp { reason, .. } => write!(f, "{reason}"),
            Self::UnknownSource { raw } => write!(f, "unknown source '{raw}'"),
            Self::UnknownType { raw } => write!(f, "unknown type '{raw}'"),
        }
    }
}

/// A malformed input record, dropped from the Event Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    /// Input file the record came from.
    pub origin_file_ref: String,
    /// Zero-based position of the record in the file's array.
    pub record_index: usize,
    #[serde(flatten)]
    pub kind: SchemaViolationKind,
    /// Truncated JSON rendering of the rejected record.
    pub excerpt: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' record {}: {}",
            self.origin_file_ref, self.record_index, self.kind
        )
    }
}

// =============================================================================
// Rule evaluation errors
// =============================================================================

/// One rule failed; the others still count. Marks the run degraded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleEvaluationError {
    pub rule_id: String,
    pub reason: String,
}

impl fmt::Display for RuleEvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule '{}' failed: {}", self.rule_id, self.reason)
    }
}

// =============================================================================
// Timeline gap warnings
// =============================================================================

/// Informational: the timeline has no activity for longer than the
/// configured threshold. Mirrors a gap marker entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineGapWarning {
    #[serde(with = "timestamp::canonical")]
    pub start: DateTime<Utc>,
    #[serde(with = "timestamp::canonical")]
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
}

impl fmt::Display for TimelineGapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no recorded activity for {}s between {} and {}",
            self.duration_secs,
            timestamp::format_canonical(&self.start),
            timestamp::format_canonical(&self.end)
        )
    }
}

// =============================================================================
// Collected diagnostics
// =============================================================================

/// Everything non-fatal that happened during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Rejected records (capped; see `schema_violations_total`).
    pub schema_violations: Vec<SchemaViolation>,
    /// Total rejected records including any beyond the retention cap.
    pub schema_violations_total: usize,
    /// Event files that could not be ingested at all.
    pub rejected_files: Vec<String>,
    pub rule_errors: Vec<RuleEvaluationError>,
    pub gap_warnings: Vec<TimelineGapWarning>,
    /// Configuration problems that were recovered from.
    pub config_warnings: Vec<String>,
}

impl Diagnostics {
    /// True when at least one rule failed.
    pub fn is_degraded(&self) -> bool {
        !self.rule_errors.is_empty()
    }

    /// True when nothing at all was reported.
    pub fn is_clean(&self) -> bool {
        self.schema_violations_total == 0
            && self.rejected_files.is_empty()
            && self.rule_errors.is_empty()
            && self.gap_warnings.is_empty()
            && self.config_warnings.is_empty()
    }
}
