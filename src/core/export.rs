// Casetrail - core/export.rs
//
// JSON and CSV export of findings, timeline and diagnostics.
// Core layer: writes to any Write implementation; the caller owns the file.
//
// Output is deterministic: the same inputs always serialise to the same
// bytes, which is what lets exports be recorded and re-verified in the
// custody manifest.

use crate::core::diagnostics::Diagnostics;
use crate::core::model::Finding;
use crate::core::summary::{FindingStats, TimelineStats};
use crate::core::timeline::{Payload, Timeline};
use crate::core::timestamp::format_canonical;
use crate::util::error::ExportError;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Contents of the diagnostics export.
#[derive(Debug, Serialize)]
pub struct DiagnosticsDocument<'a> {
    /// "success" or "degraded_success".
    pub status: &'a str,
    pub diagnostics: &'a Diagnostics,
    pub timeline_stats: &'a TimelineStats,
    pub finding_stats: &'a FindingStats,
}

/// Write any serialisable value as pretty JSON.
pub fn export_json<T, W>(value: &T, writer: W, export_path: &Path) -> Result<(), ExportError>
where
    T: Serialize + ?Sized,
    W: Write,
{
    serde_json::to_writer_pretty(writer, value).map_err(|e| ExportError::Json {
        path: export_path.to_path_buf(),
        source: e,
    })
}

/// Export findings as a JSON array, in the order given.
pub fn export_findings_json<W: Write>(
    findings: &[Arc<Finding>],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    export_json(findings, writer, export_path)?;
    Ok(findings.len())
}

/// Export the timeline as a JSON array of entries.
pub fn export_timeline_json<W: Write>(
    timeline: &Timeline,
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    export_json(timeline, writer, export_path)?;
    Ok(timeline.len())
}

/// Export the timeline as flat CSV, one row per entry.
///
/// Columns: sequence_index, timestamp, kind, source, type, rule_id,
/// severity, evidence_refs, duplicate_count, text. `text` is the event
/// details, the finding explanation, or the gap bounds.
pub fn export_timeline_csv<W: Write>(
    timeline: &Timeline,
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    let csv_err = |e: csv::Error| ExportError::Csv {
        path: export_path.to_path_buf(),
        source: e,
    };
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer
        .write_record([
            "sequence_index",
            "timestamp",
            "kind",
            "source",
            "type",
            "rule_id",
            "severity",
            "evidence_refs",
            "duplicate_count",
            "text",
        ])
        .map_err(csv_err)?;

    for entry in timeline.entries() {
        let seq = entry.sequence_index().to_string();
        let ts = format_canonical(&entry.timestamp());
        let kind = entry.kind().label();
        let row: [String; 7] = match entry.payload() {
            Payload::Event(e) => [
                e.source().label().to_string(),
                e.event_type().label().to_string(),
                String::new(),
                String::new(),
                e.id().to_string(),
                entry.duplicate_count().to_string(),
                e.details().to_string(),
            ],
            Payload::Finding(f) => [
                String::new(),
                String::new(),
                f.rule_id().to_string(),
                f.severity().label().to_string(),
                f.evidence_refs()
                    .iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
                String::new(),
                f.explanation().to_string(),
            ],
            Payload::Gap(g) => [
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                format!(
                    "no activity for {}s ({} to {})",
                    g.duration_secs,
                    format_canonical(&g.start),
                    format_canonical(&g.end)
                ),
            ],
        };
        csv_writer
            .write_record(
                [seq.as_str(), ts.as_str(), kind]
                    .into_iter()
                    .chain(row.iter().map(String::as_str)),
            )
            .map_err(csv_err)?;
    }

    csv_writer.flush().map_err(|e| ExportError::Io {
        path: export_path.to_path_buf(),
        source: e,
    })?;

    Ok(timeline.len())
}
