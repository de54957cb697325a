// Casetrail - core/rules/behavior.rs
//
// Behaviour rules: patterns over ordered event subsequences within one
// source. All thresholds come from configuration; nothing here has a
// built-in default window or count.

use super::{
    check_ref_count, narrowed, sources_in, text, validate_scope, validate_secs, EvalContext,
    Evaluator, HourWindow, RuleFailure,
};
use crate::core::event_store::{EventStore, ViewScope};
use crate::core::model::{Event, EventType, Finding, RuleCategory, Severity, Source, TimeSpan};
use crate::core::timestamp::format_canonical;
use std::sync::Arc;

fn secs_between(earlier: &Event, later: &Event) -> i64 {
    (later.timestamp() - earlier.timestamp()).num_seconds()
}

// =============================================================================
// Burst
// =============================================================================

/// N or more matching events inside a sliding window of W seconds.
///
/// Windows are reported without overlap: once a burst is found, scanning
/// resumes after its last event, so a long flurry yields one finding per
/// non-overlapping window rather than one per starting event.
#[derive(Debug, Clone)]
pub struct BurstRule {
    pub id: String,
    pub severity: Severity,
    /// Must name a source.
    pub scope: ViewScope,
    pub event_type: Option<EventType>,
    pub min_events: usize,
    pub window_secs: i64,
    /// Only count events whose device-local hour falls in this window.
    pub hours: Option<HourWindow>,
}

impl BurstRule {
    pub fn new(id: impl Into<String>, source: Source, min_events: usize, window_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::Medium,
            scope: ViewScope::source(source),
            event_type: None,
            min_events,
            window_secs,
            hours: None,
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_hours(mut self, hours: HourWindow) -> Self {
        self.hours = Some(hours);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    fn validate(&self) -> Result<Source, RuleFailure> {
        let source = self
            .scope
            .source
            .ok_or_else(|| RuleFailure::Misconfigured("burst rule has no source".to_string()))?;
        validate_scope(&self.scope)?;
        if self.min_events < 2 {
            return Err(RuleFailure::Misconfigured(format!(
                "min_events must be at least 2, got {}",
                self.min_events
            )));
        }
        validate_secs("window", self.window_secs, 1)?;
        if let Some(hours) = self.hours {
            hours.validate()?;
        }
        Ok(source)
    }

    fn explain(&self, window: &[Arc<Event>], source: Source, ctx: &EvalContext<'_>) -> String {
        let what = match self.event_type {
            Some(t) => format!("{source} {t}"),
            None => source.to_string(),
        };
        let first = &window[0];
        let last = &window[window.len() - 1];
        let hours = match self.hours {
            Some(h) => format!(" during local hours {h} (UTC{})", ctx.utc_offset),
            None => String::new(),
        };
        format!(
            "{} {what} events within {}s ({} to {}){hours}; threshold is {} events within {}s",
            window.len(),
            secs_between(first, last),
            format_canonical(&first.timestamp()),
            format_canonical(&last.timestamp()),
            self.min_events,
            self.window_secs
        )
    }
}

impl Evaluator for BurstRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Behavior
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        let source = self.validate()?;

        let mut events: Vec<Arc<Event>> = store
            .view(self.scope)
            .into_iter()
            .filter(|e| self.event_type.map_or(true, |t| e.event_type() == t))
            .filter(|e| {
                self.hours
                    .map_or(true, |h| h.contains(ctx.local_hour(e.timestamp())))
            })
            .collect();
        // Exact duplicates share an id and sit next to each other in
        // timeline order; they count as one event, as on the timeline.
        events.dedup_by(|a, b| a.id() == b.id());

        let mut findings = Vec::new();
        let mut i = 0;
        let mut j = 0;
        while i < events.len() {
            ctx.checkpoint()?;
            j = j.max(i);
            while j + 1 < events.len() && secs_between(&events[i], &events[j + 1]) <= self.window_secs
            {
                j += 1;
            }

            let count = j - i + 1;
            if count < self.min_events {
                i += 1;
                continue;
            }

            check_ref_count(count)?;
            let window = &events[i..=j];
            findings.push(Finding::new(
                &self.id,
                RuleCategory::Behavior,
                self.severity,
                TimeSpan::range(window[0].timestamp(), window[count - 1].timestamp()),
                window.iter().map(|e| e.id().clone()),
                self.explain(window, source, ctx),
            ));
            i = j + 1;
        }

        Ok(findings)
    }
}

// =============================================================================
// Delete then re-create
// =============================================================================

/// A `deleted` event followed within the interval by a `created` event for
/// the same artifact in the same source.
#[derive(Debug, Clone)]
pub struct DeleteRecreateRule {
    pub id: String,
    pub severity: Severity,
    /// Without a source, every source is checked separately.
    pub scope: ViewScope,
    pub max_interval_secs: i64,
}

impl DeleteRecreateRule {
    pub fn new(id: impl Into<String>, max_interval_secs: i64) -> Self {
        Self {
            id: id.into(),
            severity: Severity::Medium,
            scope: ViewScope::default(),
            max_interval_secs,
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

impl Evaluator for DeleteRecreateRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Behavior
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        validate_secs("max_interval", self.max_interval_secs, 0)?;

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            let events = store.view(narrowed(&self.scope, source));
            // Each `created` event pairs with at most one deletion.
            let mut used = vec![false; events.len()];

            for (i, deleted) in events.iter().enumerate() {
                if deleted.event_type() != EventType::Deleted {
                    continue;
                }
                ctx.checkpoint()?;

                let from = events.partition_point(|e| e.timestamp() < deleted.timestamp());
                for k in from..events.len() {
                    let created = &events[k];
                    if secs_between(deleted, created) > self.max_interval_secs {
                        break;
                    }
                    if k == i || used[k] || created.event_type() != EventType::Created {
                        continue;
                    }
                    let Some(subject) = text::shared_subject(deleted.details(), created.details())
                    else {
                        continue;
                    };

                    used[k] = true;
                    findings.push(Finding::new(
                        &self.id,
                        RuleCategory::Behavior,
                        self.severity,
                        TimeSpan::range(deleted.timestamp(), created.timestamp()),
                        [deleted.id().clone(), created.id().clone()],
                        format!(
                            "{source} item '{subject}' deleted at {} and re-created {}s later at {}; limit is {}s",
                            format_canonical(&deleted.timestamp()),
                            secs_between(deleted, created),
                            format_canonical(&created.timestamp()),
                            self.max_interval_secs
                        ),
                    ));
                    break;
                }
            }
        }
        Ok(findings)
    }
}

// =============================================================================
// Unusual hours
// =============================================================================

/// Aggregate activity inside a device-local hour window (e.g. 02:00-05:00)
/// reaching a configured count. One finding per source.
#[derive(Debug, Clone)]
pub struct UnusualHoursRule {
    pub id: String,
    pub severity: Severity,
    pub scope: ViewScope,
    pub hours: HourWindow,
    pub min_events: usize,
}

impl UnusualHoursRule {
    pub fn new(id: impl Into<String>, hours: HourWindow, min_events: usize) -> Self {
        Self {
            id: id.into(),
            severity: Severity::Low,
            scope: ViewScope::default(),
            hours,
            min_events,
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

impl Evaluator for UnusualHoursRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Behavior
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        validate_scope(&self.scope)?;
        self.hours.validate()?;
        if self.min_events == 0 {
            return Err(RuleFailure::Misconfigured(
                "min_events must be at least 1".to_string(),
            ));
        }

        let mut findings = Vec::new();
        for source in sources_in(&self.scope) {
            ctx.checkpoint()?;
            let mut matching: Vec<Arc<Event>> = store
                .view(narrowed(&self.scope, source))
                .into_iter()
                .filter(|e| self.hours.contains(ctx.local_hour(e.timestamp())))
                .collect();
            matching.dedup_by(|a, b| a.id() == b.id());
            if matching.is_empty() || matching.len() < self.min_events {
                continue;
            }
            check_ref_count(matching.len())?;

            let first = matching[0].timestamp();
            let last = matching[matching.len() - 1].timestamp();
            findings.push(Finding::new(
                &self.id,
                RuleCategory::Behavior,
                self.severity,
                TimeSpan::range(first, last),
                matching.iter().map(|e| e.id().clone()),
                format!(
                    "{} {source} events during local hours {} (UTC{}) between {} and {}; threshold is {}",
                    matching.len(),
                    self.hours,
                    ctx.utc_offset,
                    format_canonical(&first),
                    format_canonical(&last),
                    self.min_events
                ),
            ));
        }
        Ok(findings)
    }
}
