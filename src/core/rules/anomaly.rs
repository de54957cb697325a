// Casetrail - core/rules/anomaly.rs
//
// Anomaly rules: timestamps that cannot be trusted at face value.
//
// The clock-jump rule is the only rule that reads events in ingestion order
// rather than timeline order; a device clock moved backwards shows up as a
// record whose timestamp precedes one ingested before it from the same
// extracted file. Order across files is just argument order and means
// nothing.

use super::{
    check_ref_count, narrowed, sources_in, validate_scope, validate_secs, EvalContext, Evaluator,
    RuleFailure,
};
use crate::core::event_store::{EventStore, ViewScope};
use crate::core::model::{Event, EventId, EventType, Finding, RuleCategory, Severity, TimeSpan};
use crate::core::timestamp::format_canonical;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Clock jump
// =============================================================================

/// An event whose timestamp is earlier than the latest timestamp already
/// seen from the same source and origin file by more than the tolerance.
#[derive(Debug, Clone)]
pub struct ClockJumpRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
    pub tolerance_secs: i64,
}

impl ClockJumpRule {
    pub fn new(id: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::High,
            scope: ViewScope::default(),
            tolerance_secs,
        }
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl Evaluator for ClockJumpRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        validate_secs("tolerance", self.tolerance_secs, 0)?;

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            ctx.checkpoint()?;
            let events = store.view_in_ingestion_order(narrowed(&self.scope, source));
            // Running maximum per origin file.
            let mut latest: BTreeMap<&str, &Arc<Event>> = BTreeMap::new();
            for event in &events {
                let origin = event.origin_file_ref();
                let Some(&high) = latest.get(origin) else {
                    latest.insert(origin, event);
                    continue;
                };
                let behind = (high.timestamp() - event.timestamp()).num_seconds();
                if behind > self.tolerance_secs {
                    findings.push(Finding::new(
                        &self.id,
                        RuleCategory::Anomaly,
                        self.severity,
                        TimeSpan::range(event.timestamp(), high.timestamp()),
                        [event.id().clone(), high.id().clone()],
                        format!(
                            "{source} event at {} was recorded in '{origin}' after an event at {}, going back {behind}s; tolerance is {}s; possible clock manipulation",
                            format_canonical(&event.timestamp()),
                            format_canonical(&high.timestamp()),
                            self.tolerance_secs
                        ),
                    ));
                }
                if event.timestamp() > high.timestamp() {
                    latest.insert(origin, event);
                }
            }
        }
        Ok(findings)
    }
}

// =============================================================================
// Activity gap
// =============================================================================

/// Consecutive events of one source further apart than the threshold.
#[derive(Debug, Clone)]
pub struct ActivityGapRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
    pub threshold_secs: i64,
}

impl ActivityGapRule {
    pub fn new(id: impl Into<String>, threshold_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::Medium,
            scope: ViewScope::default(),
            threshold_secs,
        }
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl Evaluator for ActivityGapRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        validate_secs("threshold", self.threshold_secs, 1)?;

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            ctx.checkpoint()?;
            let events = store.view(narrowed(&self.scope, source));
            for pair in events.windows(2) {
                let (before, after) = (&pair[0], &pair[1]);
                let gap = (after.timestamp() - before.timestamp()).num_seconds();
                if gap <= self.threshold_secs {
                    continue;
                }
                findings.push(Finding::new(
                    &self.id,
                    RuleCategory::Anomaly,
                    self.severity,
                    TimeSpan::range(before.timestamp(), after.timestamp()),
                    [before.id().clone(), after.id().clone()],
                    format!(
                        "no {source} activity for {gap}s between {} and {}; threshold is {}s; possible deletion window",
                        format_canonical(&before.timestamp()),
                        format_canonical(&after.timestamp()),
                        self.threshold_secs
                    ),
                ));
            }
        }
        Ok(findings)
    }
}

// =============================================================================
// Divergent duplicates
// =============================================================================

/// Events of one source sharing a timestamp but carrying different details.
#[derive(Debug, Clone)]
pub struct DivergentDuplicateRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
}

impl DivergentDuplicateRule {
    pub fn new(id: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            severity,
            scope: ViewScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }
}

impl Evaluator for DivergentDuplicateRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            ctx.checkpoint()?;
            let events = store.view(narrowed(&self.scope, source));
            // Timeline order keeps equal timestamps adjacent.
            for group in group_by_timestamp(&events) {
                let variants: BTreeSet<&str> = group.iter().map(|e| e.details()).collect();
                if variants.len() < 2 {
                    continue;
                }
                let refs: BTreeSet<EventId> = group.iter().map(|e| e.id().clone()).collect();
                check_ref_count(refs.len())?;
                let count = refs.len();
                let ts = group[0].timestamp();
                findings.push(Finding::new(
                    &self.id,
                    RuleCategory::Anomaly,
                    self.severity,
                    TimeSpan::at(ts),
                    refs,
                    format!(
                        "{count} {source} events share timestamp {} with {} different details; possible tampering or duplicate extraction",
                        format_canonical(&ts),
                        variants.len()
                    ),
                ));
            }
        }
        Ok(findings)
    }
}

/// Runs of consecutive events with the same timestamp.
fn group_by_timestamp(events: &[Arc<Event>]) -> Vec<&[Arc<Event>]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=events.len() {
        if i == events.len() || events[i].timestamp() != events[start].timestamp() {
            groups.push(&events[start..i]);
            start = i;
        }
    }
    groups
}

// =============================================================================
// Post-deletion activity
// =============================================================================

/// Non-delete activity of the same source within `window_secs` after a
/// `deleted` event. A device that keeps producing records right after a
/// wipe may have had data restored, or the deletion record may be false.
/// One finding per deletion.
#[derive(Debug, Clone)]
pub struct PostDeletionActivityRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
    pub window_secs: i64,
}

impl PostDeletionActivityRule {
    pub fn new(id: impl Into<String>, window_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::High,
            scope: ViewScope::default(),
            window_secs,
        }
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl Evaluator for PostDeletionActivityRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        validate_secs("window", self.window_secs, 1)?;

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            ctx.checkpoint()?;
            let events = store.view(narrowed(&self.scope, source));
            for (i, deletion) in events.iter().enumerate() {
                if deletion.event_type() != EventType::Deleted {
                    continue;
                }
                // Duplicates sort next to each other.
                if i > 0 && events[i - 1].id() == deletion.id() {
                    continue;
                }
                let deleted_at = deletion.timestamp();
                let after: Vec<&Arc<Event>> = events[i + 1..]
                    .iter()
                    .take_while(|e| (e.timestamp() - deleted_at).num_seconds() <= self.window_secs)
                    .filter(|e| e.timestamp() > deleted_at && e.event_type() != EventType::Deleted)
                    .collect();
                let Some(last) = after.last() else {
                    continue;
                };

                let refs: BTreeSet<EventId> = std::iter::once(deletion)
                    .chain(after.iter().copied())
                    .map(|e| e.id().clone())
                    .collect();
                check_ref_count(refs.len())?;
                // Exact duplicates share an id and count once.
                let activity = refs.len() - 1;
                findings.push(Finding::new(
                    &self.id,
                    RuleCategory::Anomaly,
                    self.severity,
                    TimeSpan::range(deleted_at, last.timestamp()),
                    refs,
                    format!(
                        "{activity} {source} events within {}s after a deletion at {} ('{}'); window is {}s; possible restored data or false deletion record",
                        (last.timestamp() - deleted_at).num_seconds(),
                        format_canonical(&deleted_at),
                        deletion.details(),
                        self.window_secs
                    ),
                ));
            }
        }
        Ok(findings)
    }
}

// =============================================================================
// Future timestamps
// =============================================================================

/// Events dated after a fixed reference instant (typically the acquisition
/// time) plus a tolerance. The reference is configuration, never the
/// current clock.
#[derive(Debug, Clone)]
pub struct FutureTimestampRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
    pub reference: DateTime<Utc>,
    pub tolerance_secs: i64,
}

impl FutureTimestampRule {
    pub fn new(id: impl Into<String>, reference: DateTime<Utc>, tolerance_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::High,
            scope: ViewScope::default(),
            reference,
            tolerance_secs,
        }
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl Evaluator for FutureTimestampRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        validate_secs("tolerance", self.tolerance_secs, 0)?;

        let mut findings = Vec::new();
        for event in store.view(self.scope) {
            ctx.checkpoint()?;
            let ahead = (event.timestamp() - self.reference).num_seconds();
            if ahead <= self.tolerance_secs {
                continue;
            }
            findings.push(Finding::new(
                &self.id,
                RuleCategory::Anomaly,
                self.severity,
                TimeSpan::at(event.timestamp()),
                [event.id().clone()],
                format!(
                    "{} event at {} is {ahead}s after the reference time {}; tolerance is {}s",
                    event.source(),
                    format_canonical(&event.timestamp()),
                    format_canonical(&self.reference),
                    self.tolerance_secs
                ),
            ));
        }
        Ok(findings)
    }
}

// =============================================================================
// Unattested origin
// =============================================================================

/// Events whose origin file has no ingest-stage digest in the custody
/// manifest. One finding per origin file.
#[derive(Debug, Clone)]
pub struct UnattestedOriginRule {
    pub id: String,
    pub severity: Severity,
}

impl UnattestedOriginRule {
    pub fn new(id: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            severity,
        }
    }
}

impl Evaluator for UnattestedOriginRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Anomaly
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        let mut by_origin: BTreeMap<&str, Vec<&Arc<Event>>> = BTreeMap::new();
        for event in store.in_ingestion_order() {
            by_origin.entry(event.origin_file_ref()).or_default().push(event);
        }

        let mut findings = Vec::new();
        for (origin, events) in by_origin {
            ctx.checkpoint()?;
            if ctx.manifest.is_attested_at_ingest(origin) {
                continue;
            }
            check_ref_count(events.len())?;
            let first = events.iter().map(|e| e.timestamp()).min();
            let last = events.iter().map(|e| e.timestamp()).max();
            let (Some(first), Some(last)) = (first, last) else {
                continue;
            };
            let refs: BTreeSet<EventId> = events.iter().map(|e| e.id().clone()).collect();
            findings.push(Finding::new(
                &self.id,
                RuleCategory::Anomaly,
                self.severity,
                TimeSpan::range(first, last),
                refs,
                format!(
                    "{} events come from '{origin}', which has no ingest digest in the custody manifest",
                    events.len()
                ),
            ));
        }
        Ok(findings)
    }
}
