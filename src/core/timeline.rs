// Casetrail - core/timeline.rs
//
// Timeline reconstruction: merges events and findings into one ordered,
// de-duplicated sequence and annotates gaps in recorded activity.
//
// Ordering: timestamp first; at equal timestamps events precede findings;
// events then order by source priority and id, findings by rule id and
// first evidence ref. The result is a pure function of its inputs.

use crate::core::diagnostics::TimelineGapWarning;
use crate::core::model::{Event, Finding};
use crate::core::timestamp::{self, format_canonical};
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Entry types
// =============================================================================

/// An interval with no recorded activity longer than the gap threshold.
/// Presentation metadata only; it is not a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GapMarker {
    #[serde(with = "timestamp::canonical")]
    pub start: DateTime<Utc>,
    #[serde(with = "timestamp::canonical")]
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
}

/// What a timeline entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Event(Arc<Event>),
    Finding(Arc<Finding>),
    Gap(GapMarker),
}

/// Entry kind as exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Event,
    Finding,
    Gap,
}

impl EntryKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Event => "event",
            EntryKind::Finding => "finding",
            EntryKind::Gap => "gap",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One position in the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    sequence_index: usize,
    timestamp: DateTime<Utc>,
    payload: Payload,
    /// How many exact-duplicate events this entry stands for (events only).
    duplicate_count: usize,
}

impl TimelineEntry {
    /// 1-based position in the timeline.
    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> EntryKind {
        match self.payload {
            Payload::Event(_) => EntryKind::Event,
            Payload::Finding(_) => EntryKind::Finding,
            Payload::Gap(_) => EntryKind::Gap,
        }
    }

    pub fn is_gap_marker(&self) -> bool {
        matches!(self.payload, Payload::Gap(_))
    }

    /// Number of input events collapsed into this entry; 0 for findings
    /// and gap markers.
    pub fn duplicate_count(&self) -> usize {
        self.duplicate_count
    }
}

impl Serialize for TimelineEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let collapsed = self.duplicate_count > 1;
        let mut map = serializer.serialize_map(Some(if collapsed { 5 } else { 4 }))?;
        map.serialize_entry("sequence_index", &self.sequence_index)?;
        map.serialize_entry("timestamp", &format_canonical(&self.timestamp))?;
        map.serialize_entry("kind", self.kind().label())?;
        match &self.payload {
            Payload::Event(e) => map.serialize_entry("payload", e.as_ref())?,
            Payload::Finding(f) => map.serialize_entry("payload", f.as_ref())?,
            Payload::Gap(g) => map.serialize_entry("payload", g)?,
        }
        if collapsed {
            map.serialize_entry("duplicate_count", &self.duplicate_count)?;
        }
        map.end()
    }
}

// =============================================================================
// Timeline
// =============================================================================

/// The ordered sequence of entries, plus a warning per gap marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    gap_warnings: Vec<TimelineGapWarning>,
}

impl Timeline {
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn gap_warnings(&self) -> &[TimelineGapWarning] {
        &self.gap_warnings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }
}

impl Serialize for Timeline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds timelines. The gap pass only runs when a threshold is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineBuilder {
    gap_threshold_secs: Option<i64>,
}

impl TimelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gap_threshold(mut self, secs: i64) -> Self {
        self.gap_threshold_secs = Some(secs);
        self
    }

    pub fn gap_threshold_secs(&self) -> Option<i64> {
        self.gap_threshold_secs
    }

    /// Merge `events` and `findings` into a timeline.
    ///
    /// Neither input needs to be pre-sorted. Exact-duplicate events collapse
    /// into the first occurrence in sorted order.
    pub fn build(&self, events: &[Arc<Event>], findings: &[Arc<Finding>]) -> Timeline {
        let collapsed = collapse_duplicates(events);

        let mut findings: Vec<Arc<Finding>> = findings.to_vec();
        findings.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let merged = merge(collapsed, findings);
        let (entries, gap_warnings) = self.annotate_gaps(merged);

        tracing::info!(
            entries = entries.len(),
            gaps = gap_warnings.len(),
            "Timeline built"
        );

        Timeline {
            entries,
            gap_warnings,
        }
    }

    fn annotate_gaps(
        &self,
        merged: Vec<(Payload, usize)>,
    ) -> (Vec<TimelineEntry>, Vec<TimelineGapWarning>) {
        let mut entries: Vec<TimelineEntry> = Vec::with_capacity(merged.len());
        let mut warnings = Vec::new();
        let mut previous: Option<DateTime<Utc>> = None;

        for (payload, duplicate_count) in merged {
            let ts = anchor(&payload);
            if let (Some(threshold), Some(prev)) = (self.gap_threshold_secs, previous) {
                let duration_secs = (ts - prev).num_seconds();
                if duration_secs > threshold {
                    let gap = GapMarker {
                        start: prev,
                        end: ts,
                        duration_secs,
                    };
                    tracing::debug!(
                        start = %format_canonical(&prev),
                        end = %format_canonical(&ts),
                        duration_secs,
                        "Timeline gap"
                    );
                    warnings.push(TimelineGapWarning {
                        start: prev,
                        end: ts,
                        duration_secs,
                    });
                    entries.push(TimelineEntry {
                        sequence_index: entries.len() + 1,
                        timestamp: prev,
                        payload: Payload::Gap(gap),
                        duplicate_count: 0,
                    });
                }
            }
            entries.push(TimelineEntry {
                sequence_index: entries.len() + 1,
                timestamp: ts,
                payload,
                duplicate_count,
            });
            previous = Some(ts);
        }
        (entries, warnings)
    }
}

fn anchor(payload: &Payload) -> DateTime<Utc> {
    match payload {
        Payload::Event(e) => e.timestamp(),
        Payload::Finding(f) => f.anchor(),
        Payload::Gap(g) => g.start,
    }
}

/// Sort events and fold exact duplicates together, counting them.
fn collapse_duplicates(events: &[Arc<Event>]) -> Vec<(Arc<Event>, usize)> {
    let mut sorted: Vec<Arc<Event>> = events.to_vec();
    sorted.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut collapsed: Vec<(Arc<Event>, usize)> = Vec::with_capacity(sorted.len());
    for event in sorted {
        match collapsed.last_mut() {
            Some((kept, count)) if kept.is_exact_duplicate_of(&event) => *count += 1,
            _ => collapsed.push((event, 1)),
        }
    }
    collapsed
}

/// Stable two-way merge; an event wins a timestamp tie against a finding.
fn merge(events: Vec<(Arc<Event>, usize)>, findings: Vec<Arc<Finding>>) -> Vec<(Payload, usize)> {
    let mut merged = Vec::with_capacity(events.len() + findings.len());
    let mut events = events.into_iter().peekable();
    let mut findings = findings.into_iter().peekable();

    loop {
        let take_event = match (events.peek(), findings.peek()) {
            (Some((e, _)), Some(f)) => e.timestamp() <= f.anchor(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_event {
            if let Some((e, count)) = events.next() {
                merged.push((Payload::Event(e), count));
            }
        } else if let Some(f) = findings.next() {
            merged.push((Payload::Finding(f), 0));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{EventType, RuleCategory, Severity, Source, TimeSpan};
    use crate::core::timestamp::parse_canonical;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_canonical(raw).unwrap()
    }

    fn event(raw: &str, source: Source, event_type: EventType, details: &str) -> Arc<Event> {
        Arc::new(Event::new(ts(raw), source, event_type, details, "events.json"))
    }

    fn finding(raw: &str, rule: &str, refs: &[&Arc<Event>]) -> Arc<Finding> {
        Arc::new(Finding::new(
            rule,
            RuleCategory::Anomaly,
            Severity::Medium,
            TimeSpan::at(ts(raw)),
            refs.iter().map(|e| e.id().clone()),
            format!("{rule} fired"),
        ))
    }

    #[test]
    fn test_gap_marker_between_sms_and_call() {
        let events = vec![
            event("2024-01-01 09:10:00", Source::Call, EventType::Incoming, "+44 20 7946 0000"),
            event("2024-01-01 09:00:05", Source::Sms, EventType::Outgoing, "on my way"),
            event("2024-01-01 09:00:00", Source::Sms, EventType::Incoming, "where are you"),
        ];
        let timeline = TimelineBuilder::new()
            .with_gap_threshold(300)
            .build(&events, &[]);

        let kinds: Vec<EntryKind> = timeline.entries().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Event, EntryKind::Event, EntryKind::Gap, EntryKind::Event]
        );
        let Payload::Gap(gap) = timeline.entries()[2].payload() else {
            panic!("expected a gap marker");
        };
        assert_eq!(gap.start, ts("2024-01-01 09:00:05"));
        assert_eq!(gap.end, ts("2024-01-01 09:10:00"));
        assert_eq!(gap.duration_secs, 595);
        assert!(timeline.entries()[2].is_gap_marker());
        assert_eq!(timeline.gap_warnings().len(), 1);

        let indices: Vec<usize> = timeline.entries().iter().map(|e| e.sequence_index()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_no_threshold_means_no_gap_pass() {
        let events = vec![
            event("2024-01-01 09:00:00", Source::Sms, EventType::Incoming, "a"),
            event("2024-02-01 09:00:00", Source::Sms, EventType::Incoming, "b"),
        ];
        let timeline = TimelineBuilder::new().build(&events, &[]);
        assert_eq!(timeline.count(EntryKind::Gap), 0);
        assert!(timeline.gap_warnings().is_empty());
    }

    #[test]
    fn test_exact_duplicates_collapse_with_count() {
        let a = event("2024-01-01 09:00:00", Source::Sms, EventType::Incoming, "hi");
        let a_copy = Arc::new(Event::new(
            ts("2024-01-01 09:00:00"),
            Source::Sms,
            EventType::Incoming,
            "hi",
            "backup.json",
        ));
        let b = event("2024-01-01 09:00:00", Source::Sms, EventType::Incoming, "hi again");
        let timeline = TimelineBuilder::new().build(&[a, a_copy, b], &[]);

        assert_eq!(timeline.count(EntryKind::Event), 2);
        let counts: Vec<usize> = timeline.entries().iter().map(|e| e.duplicate_count()).collect();
        assert_eq!(counts.iter().sum::<usize>(), 3);
        assert!(counts.contains(&2));
    }

    #[test]
    fn test_event_precedes_finding_at_equal_timestamp() {
        let e = event("2024-01-01 09:00:00", Source::App, EventType::Created, "x");
        let later = event("2024-01-01 09:00:01", Source::App, EventType::Created, "y");
        let f = finding("2024-01-01 09:00:00", "rule-a", &[&e]);
        let timeline = TimelineBuilder::new().build(&[later, e], &[f]);

        let kinds: Vec<EntryKind> = timeline.entries().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EntryKind::Event, EntryKind::Finding, EntryKind::Event]);
    }

    #[test]
    fn test_totality_and_idempotence() {
        let events: Vec<Arc<Event>> = (0..20)
            .map(|i| {
                event(
                    &format!("2024-01-01 09:{:02}:00", (i * 7) % 60),
                    Source::all()[i % 4],
                    EventType::Modified,
                    &format!("item {}", i % 15),
                )
            })
            .collect();
        let findings = vec![
            finding("2024-01-01 09:30:00", "b-rule", &[&events[1]]),
            finding("2024-01-01 09:30:00", "a-rule", &[&events[2]]),
            finding("2024-01-01 08:00:00", "c-rule", &[&events[3]]),
        ];
        let builder = TimelineBuilder::new().with_gap_threshold(120);

        let first = builder.build(&events, &findings);
        let mut reversed = events.clone();
        reversed.reverse();
        let second = builder.build(&reversed, &findings);

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let distinct: std::collections::BTreeSet<_> = events.iter().map(|e| e.id().clone()).collect();
        assert_eq!(first.count(EntryKind::Event), distinct.len());
        assert_eq!(first.count(EntryKind::Finding), findings.len());

        let stamps: Vec<DateTime<Utc>> = first.entries().iter().map(|e| e.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_export_shape() {
        let a = event("2024-01-01 09:00:00", Source::Sms, EventType::Incoming, "hi");
        let b = event("2024-01-01 10:00:00", Source::Sms, EventType::Incoming, "later");
        let timeline = TimelineBuilder::new()
            .with_gap_threshold(60)
            .build(&[a.clone(), a, b], &[]);
        let json = serde_json::to_value(&timeline).unwrap();

        assert_eq!(json[0]["sequence_index"], 1);
        assert_eq!(json[0]["kind"], "event");
        assert_eq!(json[0]["duplicate_count"], 2);
        assert_eq!(json[0]["payload"]["details"], "hi");
        assert_eq!(json[1]["kind"], "gap");
        assert_eq!(json[1]["timestamp"], "2024-01-01 09:00:00");
        assert_eq!(json[1]["payload"]["duration_secs"], 3600);
        assert!(json[2].get("duplicate_count").is_none());
    }
}
