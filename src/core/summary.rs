// Casetrail - core/summary.rs
//
// Case statistics computed from a built timeline and the findings list.
// BTreeMaps keep the exported key order stable.

use crate::core::model::{EventType, Finding, RuleCategory, Severity, Source};
use crate::core::timeline::{EntryKind, Payload, Timeline};
use crate::core::timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts over the timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimelineStats {
    pub total_entries: usize,
    pub event_entries: usize,
    pub finding_entries: usize,
    pub gap_markers: usize,
    /// Input events folded into another entry as exact duplicates.
    pub collapsed_duplicates: usize,
    #[serde(with = "timestamp::canonical_opt")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(with = "timestamp::canonical_opt")]
    pub last_timestamp: Option<DateTime<Utc>>,
    pub events_by_source: BTreeMap<Source, usize>,
    pub events_by_type: BTreeMap<EventType, usize>,
}

impl TimelineStats {
    pub fn from_timeline(timeline: &Timeline) -> Self {
        let mut stats = TimelineStats {
            total_entries: timeline.len(),
            event_entries: timeline.count(EntryKind::Event),
            finding_entries: timeline.count(EntryKind::Finding),
            gap_markers: timeline.count(EntryKind::Gap),
            ..Default::default()
        };

        for entry in timeline.entries() {
            if let Payload::Event(event) = entry.payload() {
                stats.collapsed_duplicates += entry.duplicate_count().saturating_sub(1);
                *stats.events_by_source.entry(event.source()).or_insert(0) += 1;
                *stats.events_by_type.entry(event.event_type()).or_insert(0) += 1;
                if stats.first_timestamp.is_none() {
                    stats.first_timestamp = Some(event.timestamp());
                }
                stats.last_timestamp = Some(event.timestamp());
            }
        }
        stats
    }
}

/// Counts over the findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FindingStats {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<RuleCategory, usize>,
    pub by_rule: BTreeMap<String, usize>,
}

impl FindingStats {
    pub fn from_findings(findings: &[Arc<Finding>]) -> Self {
        let mut stats = FindingStats {
            total: findings.len(),
            ..Default::default()
        };
        for f in findings {
            *stats.by_severity.entry(f.severity()).or_insert(0) += 1;
            *stats.by_category.entry(f.category()).or_insert(0) += 1;
            *stats.by_rule.entry(f.rule_id().to_string()).or_insert(0) += 1;
        }
        stats
    }

    /// Highest severity present, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.by_severity.keys().next_back().copied()
    }
}
