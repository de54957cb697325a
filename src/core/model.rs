// Casetrail - core/model.rs
//
// Core data model types. Pure data definitions with no I/O.
//
// Events and Findings are immutable once constructed: fields are private and
// only readable through accessors, and both are shared across components
// behind `Arc` so no stage can alter what another stage produced.

use crate::core::timestamp;
use crate::util::constants::{EVENT_ID_FIELD_SEPARATOR, EVENT_ID_HEX_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Source
// =============================================================================

/// The device subsystem an event was extracted from.
///
/// Declaration order is the source-priority tie-break used when two events
/// share a timestamp: SMS sorts before CALL, CALL before MEDIA, MEDIA before APP.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Sms,
    Call,
    Media,
    App,
}

impl Source {
    /// Returns all variants in priority order.
    pub fn all() -> &'static [Source] {
        &[Source::Sms, Source::Call, Source::Media, Source::App]
    }

    /// Wire label, as it appears in the input schema.
    pub fn label(&self) -> &'static str {
        match self {
            Source::Sms => "SMS",
            Source::Call => "CALL",
            Source::Media => "MEDIA",
            Source::App => "APP",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Source {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMS" => Ok(Source::Sms),
            "CALL" => Ok(Source::Call),
            "MEDIA" => Ok(Source::Media),
            "APP" => Ok(Source::App),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Event type
// =============================================================================

/// What happened. Communication sources use incoming/outgoing, artefact
/// sources use created/deleted/modified.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Incoming,
    Outgoing,
    Created,
    Deleted,
    Modified,
}

impl EventType {
    pub fn label(&self) -> &'static str {
        match self {
            EventType::Incoming => "incoming",
            EventType::Outgoing => "outgoing",
            EventType::Created => "created",
            EventType::Deleted => "deleted",
            EventType::Modified => "modified",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(EventType::Incoming),
            "outgoing" => Ok(EventType::Outgoing),
            "created" => Ok(EventType::Created),
            "deleted" => Ok(EventType::Deleted),
            "modified" => Ok(EventType::Modified),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// Stable content-derived event identifier (hex prefix of a SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single normalised forensic event.
///
/// The id is a hash of the canonical fields (timestamp, source, type,
/// details), so ingesting the same record twice yields the same id and
/// exact duplicates share one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    id: EventId,

    #[serde(with = "timestamp::canonical")]
    timestamp: DateTime<Utc>,

    source: Source,

    #[serde(rename = "type")]
    event_type: EventType,

    details: String,

    origin_file_ref: String,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        source: Source,
        event_type: EventType,
        details: impl Into<String>,
        origin_file_ref: impl Into<String>,
    ) -> Self {
        let details = details.into();
        let id = Self::compute_id(&timestamp, source, event_type, &details);
        Self {
            id,
            timestamp,
            source,
            event_type,
            details,
            origin_file_ref: origin_file_ref.into(),
        }
    }

    fn compute_id(
        timestamp: &DateTime<Utc>,
        source: Source,
        event_type: EventType,
        details: &str,
    ) -> EventId {
        let mut hasher = Sha256::new();
        hasher.update(timestamp::format_canonical(timestamp).as_bytes());
        hasher.update(EVENT_ID_FIELD_SEPARATOR.to_string().as_bytes());
        hasher.update(source.label().as_bytes());
        hasher.update(EVENT_ID_FIELD_SEPARATOR.to_string().as_bytes());
        hasher.update(event_type.label().as_bytes());
        hasher.update(EVENT_ID_FIELD_SEPARATOR.to_string().as_bytes());
        hasher.update(details.as_bytes());
        let digest = hex::encode(hasher.finalize());
        EventId(digest[..EVENT_ID_HEX_LEN].to_string())
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn origin_file_ref(&self) -> &str {
        &self.origin_file_ref
    }

    /// Total order used everywhere events are sequenced:
    /// timestamp, then source priority, then id.
    pub fn order_key(&self) -> (DateTime<Utc>, Source, &EventId) {
        (self.timestamp, self.source, &self.id)
    }

    /// Two events are exact duplicates when every canonical field matches.
    /// The origin file is deliberately not part of this.
    pub fn is_exact_duplicate_of(&self, other: &Event) -> bool {
        self.timestamp == other.timestamp
            && self.source == other.source
            && self.event_type == other.event_type
            && self.details == other.details
    }
}

// =============================================================================
// Severity
// =============================================================================

/// Finding severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Returns all variants, least severe first.
    pub fn all() -> &'static [Severity] {
        &[
            Severity::Info,
            Severity::Low,
            Severity::Medium,
            Severity::High,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Rule category
// =============================================================================

/// The three families of analysis rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Behavior,
    MalwareIndicator,
    Anomaly,
}

impl RuleCategory {
    pub fn label(&self) -> &'static str {
        match self {
            RuleCategory::Behavior => "behavior",
            RuleCategory::MalwareIndicator => "malware_indicator",
            RuleCategory::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Time span
// =============================================================================

/// The instant or closed interval a finding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TimeSpan {
    #[serde(with = "timestamp::canonical")]
    start: DateTime<Utc>,

    #[serde(
        with = "timestamp::canonical_opt",
        skip_serializing_if = "Option::is_none"
    )]
    end: Option<DateTime<Utc>>,
}

impl TimeSpan {
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            start: ts,
            end: None,
        }
    }

    /// A range; collapses to an instant when both bounds are equal.
    /// Bounds given in reverse order are swapped.
    pub fn range(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        let (start, end) = if a <= b { (a, b) } else { (b, a) };
        if start == end {
            Self::at(start)
        } else {
            Self {
                start,
                end: Some(end),
            }
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end.unwrap_or(self.start)
    }

    pub fn is_range(&self) -> bool {
        self.end.is_some()
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(
                f,
                "{} to {}",
                timestamp::format_canonical(&self.start),
                timestamp::format_canonical(&end)
            ),
            None => f.write_str(&timestamp::format_canonical(&self.start)),
        }
    }
}

// =============================================================================
// Finding
// =============================================================================

/// An explainable observation produced by one rule over one or more events.
///
/// The explanation is built only from the triggering evidence and the rule's
/// configuration, never from wall-clock time, so identical inputs always
/// produce identical findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    rule_id: String,
    category: RuleCategory,
    severity: Severity,
    #[serde(rename = "timestamp_or_range")]
    span: TimeSpan,
    evidence_refs: BTreeSet<EventId>,
    explanation: String,
}

impl Finding {
    pub fn new(
        rule_id: impl Into<String>,
        category: RuleCategory,
        severity: Severity,
        span: TimeSpan,
        evidence_refs: impl IntoIterator<Item = EventId>,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            category,
            severity,
            span,
            evidence_refs: evidence_refs.into_iter().collect(),
            explanation: explanation.into(),
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn category(&self) -> RuleCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn span(&self) -> TimeSpan {
        self.span
    }

    /// The instant a finding is anchored at in the timeline.
    pub fn anchor(&self) -> DateTime<Utc> {
        self.span.start()
    }

    pub fn evidence_refs(&self) -> &BTreeSet<EventId> {
        &self.evidence_refs
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    /// Total order for findings: anchor, rule id, first evidence ref; the
    /// explanation breaks any remaining tie so output never depends on
    /// evaluation order.
    pub fn order_key(&self) -> (DateTime<Utc>, &str, Option<&EventId>, &str) {
        (
            self.span.start(),
            self.rule_id.as_str(),
            self.evidence_refs.iter().next(),
            self.explanation.as_str(),
        )
    }
}
