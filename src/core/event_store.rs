// Casetrail - core/event_store.rs
//
// Read-only in-memory collection of normalised events.
//
// Records arrive from the external normaliser as JSON arrays. Each record
// is validated on its own: a bad record becomes a SchemaViolation and is
// dropped, the rest of the file is still ingested. Once `build()` returns,
// the store never changes; rules and the timeline builder only ever read it.

use crate::core::diagnostics::{SchemaViolation, SchemaViolationKind};
use crate::core::manifest::digest_bytes;
use crate::core::model::{Event, EventType, Source};
use crate::core::timestamp::parse_canonical;
use crate::util::constants;
use crate::util::error::IngestError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::io;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Views
// =============================================================================

/// A bounded view request: optionally one source, optionally an inclusive
/// time window. `ViewScope::default()` is the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewScope {
    pub source: Option<Source>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ViewScope {
    pub fn source(source: Source) -> Self {
        Self {
            source: Some(source),
            ..Default::default()
        }
    }

    fn admits(&self, event: &Event) -> bool {
        if self.source.is_some_and(|s| s != event.source()) {
            return false;
        }
        if self.from.is_some_and(|from| event.timestamp() < from) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp() > until) {
            return false;
        }
        true
    }
}

// =============================================================================
// Store
// =============================================================================

/// Immutable event collection, kept both in ingestion order and in
/// timeline order `(timestamp, source priority, id)`.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    /// Ingestion order. The clock-jump rule depends on this.
    ingested: Vec<Arc<Event>>,
    /// Indices into `ingested`, sorted by the event order key.
    sorted: Vec<usize>,
}

impl EventStore {
    pub fn len(&self) -> usize {
        self.ingested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ingested.is_empty()
    }

    /// Events in the order they were ingested.
    pub fn in_ingestion_order(&self) -> &[Arc<Event>] {
        &self.ingested
    }

    /// Every event in timeline order.
    pub fn sorted(&self) -> Vec<Arc<Event>> {
        self.view(ViewScope::default())
    }

    /// Events admitted by `scope`, in timeline order.
    pub fn view(&self, scope: ViewScope) -> Vec<Arc<Event>> {
        self.sorted
            .iter()
            .map(|&i| &self.ingested[i])
            .filter(|e| scope.admits(e))
            .cloned()
            .collect()
    }

    /// Events admitted by `scope`, in ingestion order.
    pub fn view_in_ingestion_order(&self, scope: ViewScope) -> Vec<Arc<Event>> {
        self.ingested
            .iter()
            .filter(|e| scope.admits(e))
            .cloned()
            .collect()
    }

    /// Distinct origin files referenced by the stored events, sorted.
    pub fn origin_files(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .ingested
            .iter()
            .map(|e| e.origin_file_ref().to_string())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Per-file ingestion outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// SHA-256 of the exact bytes parsed, when they came from a file.
    pub sha256_digest: Option<String>,
}

/// Accumulates validated events from one or more input files.
#[derive(Debug, Default)]
pub struct EventStoreBuilder {
    events: Vec<Arc<Event>>,
    violations: Vec<SchemaViolation>,
    violations_total: usize,
}

impl EventStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an already-constructed event.
    pub fn push(&mut self, event: Event) -> &mut Self {
        self.events.push(Arc::new(event));
        self
    }

    /// Ingest a JSON document (an array of records) read from `origin`.
    ///
    /// Only a document that is not JSON, or not an array, is an error.
    /// Individual bad records are recorded as schema violations.
    pub fn ingest_json(&mut self, json: &str, origin: &Path) -> Result<IngestReport, IngestError> {
        let value: Value = serde_json::from_str(json).map_err(|e| IngestError::Json {
            path: origin.to_path_buf(),
            source: e,
        })?;

        let records = match value {
            Value::Array(records) => records,
            other => {
                return Err(IngestError::NotAnArray {
                    path: origin.to_path_buf(),
                    found: json_kind(&other),
                })
            }
        };

        let origin_ref = origin.display().to_string();
        let mut report = IngestReport::default();

        for (index, record) in records.iter().enumerate() {
            match validate_record(record, &origin_ref) {
                Ok(event) => {
                    self.events.push(Arc::new(event));
                    report.accepted += 1;
                }
                Err(kind) => {
                    report.rejected += 1;
                    let violation = SchemaViolation {
                        origin_file_ref: origin_ref.clone(),
                        record_index: index,
                        kind,
                        excerpt: excerpt(record),
                    };
                    tracing::debug!(violation = %violation, "Schema violation, record dropped");
                    self.violations_total += 1;
                    if self.violations.len() < constants::MAX_RECORDED_SCHEMA_VIOLATIONS {
                        self.violations.push(violation);
                    }
                }
            }
        }

        tracing::debug!(
            file = %origin.display(),
            accepted = report.accepted,
            rejected = report.rejected,
            "Event file ingested"
        );

        Ok(report)
    }

    /// Read and ingest one event file from disk. The report carries the
    /// digest of the bytes that were parsed, so custody can be checked
    /// against what was analysed rather than a second read of the file.
    pub fn ingest_file(&mut self, path: &Path) -> Result<IngestReport, IngestError> {
        let size = std::fs::metadata(path)
            .map_err(|e| IngestError::Io {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();
        if size > constants::MAX_EVENT_FILE_SIZE {
            return Err(IngestError::FileTooLarge {
                path: path.to_path_buf(),
                size,
                max: constants::MAX_EVENT_FILE_SIZE,
            });
        }
        let bytes = std::fs::read(path).map_err(|e| IngestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let digest = digest_bytes(&bytes);
        let content = String::from_utf8(bytes).map_err(|e| IngestError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        let mut report = self.ingest_json(&content, path)?;
        report.sha256_digest = Some(digest);
        Ok(report)
    }

    /// Freeze the store. Returns the store, the retained violations, and the
    /// total violation count (which may exceed the retained list).
    pub fn build(self) -> (EventStore, Vec<SchemaViolation>, usize) {
        let mut sorted: Vec<usize> = (0..self.events.len()).collect();
        // Stable: exact duplicates keep their ingestion order.
        sorted.sort_by(|&a, &b| self.events[a].order_key().cmp(&self.events[b].order_key()));

        tracing::info!(
            events = self.events.len(),
            rejected = self.violations_total,
            "Event store built"
        );

        (
            EventStore {
                ingested: self.events,
                sorted,
            },
            self.violations,
            self.violations_total,
        )
    }
}

// =============================================================================
// Record validation
// =============================================================================

/// Validate one raw record against the input schema.
fn validate_record(record: &Value, origin: &str) -> Result<Event, SchemaViolationKind> {
    let obj = record.as_object().ok_or(SchemaViolationKind::NotAnObject)?;

    let raw_ts = string_field(obj, "timestamp")?;
    let raw_source = string_field(obj, "source")?;
    let raw_type = string_field(obj, "type")?;
    let details = string_field(obj, "details")?;

    let timestamp =
        parse_canonical(raw_ts).map_err(|e| SchemaViolationKind::InvalidTimestamp {
            raw: raw_ts.to_string(),
            reason: e.to_string(),
        })?;
    let source: Source = raw_source
        .parse()
        .map_err(|_| SchemaViolationKind::UnknownSource {
            raw: raw_source.to_string(),
        })?;
    let event_type: EventType = raw_type
        .parse()
        .map_err(|_| SchemaViolationKind::UnknownType {
            raw: raw_type.to_string(),
        })?;

    Ok(Event::new(timestamp, source, event_type, details, origin))
}

fn string_field<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, SchemaViolationKind> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(SchemaViolationKind::MissingField { field }),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(SchemaViolationKind::WrongFieldType { field }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn excerpt(record: &Value) -> String {
    let rendered = record.to_string();
    if rendered.len() <= constants::SCHEMA_VIOLATION_EXCERPT_LEN {
        return rendered;
    }
    let mut cut = constants::SCHEMA_VIOLATION_EXCERPT_LEN;
    while !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &rendered[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ingest(json: &str) -> (EventStore, Vec<SchemaViolation>) {
        let mut builder = EventStoreBuilder::new();
        builder.ingest_json(json, &PathBuf::from("events.json")).unwrap();
        let (store, violations, _) = builder.build();
        (store, violations)
    }

    #[test]
    fn test_valid_records_are_ingested() {
        let (store, violations) = ingest(
            r#"[
                {"timestamp": "2024-01-01 09:00:05", "source": "SMS", "type": "outgoing", "details": "reply"},
                {"timestamp": "2024-01-01 09:00:00", "source": "SMS", "type": "incoming", "details": "hello"}
            ]"#,
        );
        assert!(violations.is_empty());
        assert_eq!(store.len(), 2);
        // Ingestion order is preserved separately from timeline order.
        assert_eq!(store.in_ingestion_order()[0].details(), "reply");
        assert_eq!(store.sorted()[0].details(), "hello");
        assert_eq!(store.sorted()[0].origin_file_ref(), "events.json");
    }

    #[test]
    fn test_malformed_records_are_rejected_individually() {
        let (store, violations) = ingest(
            r#"[
                {"timestamp": "2024-01-01 09:00:00", "source": "SMS", "type": "incoming", "details": "ok"},
                {"timestamp": "not a time", "source": "SMS", "type": "incoming", "details": "x"},
                {"timestamp": "2024-01-01 09:00:00", "source": "FAX", "type": "incoming", "details": "x"},
                {"timestamp": "2024-01-01 09:00:00", "source": "CALL", "type": "missed", "details": "x"},
                {"timestamp": "2024-01-01 09:00:00", "source": "CALL", "type": "incoming"},
                {"timestamp": "2024-01-01 09:00:00", "source": "CALL", "type": "incoming", "details": 7},
                42
            ]"#,
        );
        assert_eq!(store.len(), 1);
        let kinds: Vec<_> = violations.iter().map(|v| v.kind.clone()).collect();
        assert!(matches!(kinds[0], SchemaViolationKind::InvalidTimestamp { .. }));
        assert_eq!(kinds[1], SchemaViolationKind::UnknownSource { raw: "FAX".into() });
        assert_eq!(kinds[2], SchemaViolationKind::UnknownType { raw: "missed".into() });
        assert_eq!(kinds[3], SchemaViolationKind::MissingField { field: "details" });
        assert_eq!(kinds[4], SchemaViolationKind::WrongFieldType { field: "details" });
        assert_eq!(kinds[5], SchemaViolationKind::NotAnObject);
        assert_eq!(violations[1].record_index, 2);
    }

    #[test]
    fn test_non_array_document_is_a_file_error() {
        let mut builder = EventStoreBuilder::new();
        let result = builder.ingest_json(r#"{"events": []}"#, &PathBuf::from("bad.json"));
        assert!(matches!(result, Err(IngestError::NotAnArray { found: "an object", .. })));
        let result = builder.ingest_json("[{", &PathBuf::from("bad.json"));
        assert!(matches!(result, Err(IngestError::Json { .. })));
    }

    #[test]
    fn test_view_filters_by_source_and_window() {
        let (store, _) = ingest(
            r#"[
                {"timestamp": "2024-01-01 08:00:00", "source": "CALL", "type": "outgoing", "details": "a"},
                {"timestamp": "2024-01-01 09:00:00", "source": "CALL", "type": "outgoing", "details": "b"},
                {"timestamp": "2024-01-01 09:30:00", "source": "SMS", "type": "incoming", "details": "c"},
                {"timestamp": "2024-01-01 10:00:00", "source": "CALL", "type": "incoming", "details": "d"}
            ]"#,
        );
        let scope = ViewScope {
            source: Some(Source::Call),
            from: Some(parse_canonical("2024-01-01 09:00:00").unwrap()),
            until: Some(parse_canonical("2024-01-01 10:00:00").unwrap()),
        };
        let details: Vec<_> = store.view(scope).iter().map(|e| e.details().to_string()).collect();
        assert_eq!(details, vec!["b", "d"]);
    }

    #[test]
    fn test_reingestion_is_idempotent() {
        let json = r#"[{"timestamp": "2024-01-01 09:00:00", "source": "APP", "type": "created", "details": "x"}]"#;
        let (a, _) = ingest(json);
        let (b, _) = ingest(json);
        assert_eq!(a.sorted()[0].id(), b.sorted()[0].id());
    }

    #[test]
    fn test_ingest_file_reports_digest_of_parsed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        let json = r#"[{"timestamp": "2024-01-01 09:00:00", "source": "APP", "type": "created", "details": "x"}]"#;
        std::fs::write(&path, json).unwrap();

        let mut builder = EventStoreBuilder::new();
        let report = builder.ingest_file(&path).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.sha256_digest, Some(digest_bytes(json.as_bytes())));

        std::fs::write(&path, [0xff, 0xfe, b'[', b']']).unwrap();
        assert!(matches!(builder.ingest_file(&path), Err(IngestError::Io { .. })));
    }

    #[test]
    fn test_long_excerpt_is_truncated() {
        let long = "x".repeat(1_000);
        let json = format!(r#"[{{"timestamp": "bad", "source": "SMS", "type": "incoming", "details": "{long}"}}]"#);
        let (_, violations) = ingest(&json);
        assert!(violations[0].excerpt.ends_with("..."));
        assert!(violations[0].excerpt.len() <= constants::SCHEMA_VIOLATION_EXCERPT_LEN + 3);
    }
}
