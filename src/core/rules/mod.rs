// Casetrail - core/rules/mod.rs
//
// Rule definitions and the explicit rule table.
//
// Rules are a closed set of tagged variants. Each variant is a plain struct
// holding its configuration and implementing `Evaluator`; `Rule` dispatches
// to it. A rule is pure: it reads the Event Store (and, for the custody
// rule, the manifest) and returns findings, with no shared mutable state
// and no wall-clock reads. Adding a rule means adding a variant.

pub mod anomaly;
pub mod behavior;
pub mod engine;
pub mod malware;
mod text;

use crate::core::cancel::CancelToken;
use crate::core::event_store::{EventStore, ViewScope};
use crate::core::manifest::Manifest;
use crate::core::model::{Finding, RuleCategory, Source};
use crate::util::constants;
use crate::util::error::RuleRegistryError;
use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use std::collections::HashSet;
use std::fmt;

pub use anomaly::{
    ActivityGapRule, ClockJumpRule, DivergentDuplicateRule, FutureTimestampRule,
    PostDeletionActivityRule, UnattestedOriginRule,
};
pub use behavior::{BurstRule, DeleteRecreateRule, UnusualHoursRule};
pub use malware::{IndicatorRule, MatchMode};

// =============================================================================
// Evaluation context
// =============================================================================

/// Read-only inputs shared by every rule in one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Snapshot of the custody manifest.
    pub manifest: &'a Manifest,
    /// Set when an integrity violation aborts the run.
    pub cancel: &'a CancelToken,
    /// Offset used to turn UTC timestamps into device-local hours.
    pub utc_offset: FixedOffset,
}

impl<'a> EvalContext<'a> {
    pub fn new(manifest: &'a Manifest, cancel: &'a CancelToken) -> Self {
        Self {
            manifest,
            cancel,
            utc_offset: Utc.fix(),
        }
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    /// Safe point: stop here if the run has been cancelled.
    pub fn checkpoint(&self) -> Result<(), RuleFailure> {
        if self.cancel.is_cancelled() {
            Err(RuleFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Device-local hour of `ts`.
    pub fn local_hour(&self, ts: DateTime<Utc>) -> u32 {
        ts.with_timezone(&self.utc_offset).hour()
    }
}

// =============================================================================
// Failures
// =============================================================================

/// Why a single rule produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFailure {
    /// The rule's configuration cannot be evaluated.
    Misconfigured(String),
    /// The rule produced output that violates a finding invariant.
    InvalidOutput(String),
    /// The rule panicked; the payload message is kept.
    Panicked(String),
    /// The run was cancelled while the rule was in flight.
    Cancelled,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misconfigured(reason) => write!(f, "misconfigured: {reason}"),
            Self::InvalidOutput(reason) => write!(f, "invalid output: {reason}"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Shared configuration pieces
// =============================================================================

/// Local-hour window `[start, end)`, wrapping past midnight when
/// `start > end` (e.g. 22 -> 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn validate(&self) -> Result<(), RuleFailure> {
        if self.start > 23 || self.end > 24 || self.start == self.end {
            return Err(RuleFailure::Misconfigured(format!(
                "hour window {:02}:00-{:02}:00 is invalid (start 0-23, end 0-24, start != end)",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start < self.end {
            (self.start..self.end).contains(&hour)
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

impl fmt::Display for HourWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start, self.end)
    }
}

/// Sources a rule visits: the scoped one, or every source separately.
pub(crate) fn sources_in(scope: &ViewScope) -> Vec<Source> {
    match scope.source {
        Some(s) => vec![s],
        None => Source::all().to_vec(),
    }
}

/// `scope` narrowed to one source.
pub(crate) fn narrowed(scope: &ViewScope, source: Source) -> ViewScope {
    ViewScope {
        source: Some(source),
        ..*scope
    }
}

pub(crate) fn validate_secs(name: &str, secs: i64, min: i64) -> Result<(), RuleFailure> {
    if secs < min || secs > constants::MAX_CONFIGURED_SPAN_SECS {
        return Err(RuleFailure::Misconfigured(format!(
            "{name} must be between {min} and {} seconds, got {secs}",
            constants::MAX_CONFIGURED_SPAN_SECS
        )));
    }
    Ok(())
}

/// Fails when one finding would carry more references than allowed.
pub(crate) fn check_ref_count(count: usize) -> Result<(), RuleFailure> {
    if count > constants::MAX_EVIDENCE_REFS_PER_FINDING {
        return Err(RuleFailure::InvalidOutput(format!(
            "a single finding would reference {count} events (limit {})",
            constants::MAX_EVIDENCE_REFS_PER_FINDING
        )));
    }
    Ok(())
}

pub(crate) fn validate_scope(scope: &ViewScope) -> Result<(), RuleFailure> {
    if let (Some(from), Some(until)) = (scope.from, scope.until) {
        if from > until {
            return Err(RuleFailure::Misconfigured(format!(
                "time window starts after it ends ({from} > {until})"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Evaluator capability and the closed rule set
// =============================================================================

/// The one capability every rule variant implements.
pub trait Evaluator {
    fn id(&self) -> &str;
    fn category(&self) -> RuleCategory;
    fn evaluate(&self, store: &EventStore, ctx: &EvalContext<'_>)
        -> Result<Vec<Finding>, RuleFailure>;
}

/// Every rule the engine knows how to run.
#[derive(Debug, Clone)]
pub enum Rule {
    Burst(BurstRule),
    DeleteRecreate(DeleteRecreateRule),
    UnusualHours(UnusualHoursRule),
    Indicator(IndicatorRule),
    ClockJump(ClockJumpRule),
    ActivityGap(ActivityGapRule),
    DivergentDuplicate(DivergentDuplicateRule),
    PostDeletionActivity(PostDeletionActivityRule),
    FutureTimestamp(FutureTimestampRule),
    UnattestedOrigin(UnattestedOriginRule),
    #[cfg(test)]
    Panicking(testing::PanickingRule),
}

impl Rule {
    fn evaluator(&self) -> &dyn Evaluator {
        match self {
            Rule::Burst(r) => r,
            Rule::DeleteRecreate(r) => r,
            Rule::UnusualHours(r) => r,
            Rule::Indicator(r) => r,
            Rule::ClockJump(r) => r,
            Rule::ActivityGap(r) => r,
            Rule::DivergentDuplicate(r) => r,
            Rule::PostDeletionActivity(r) => r,
            Rule::FutureTimestamp(r) => r,
            Rule::UnattestedOrigin(r) => r,
            #[cfg(test)]
            Rule::Panicking(r) => r,
        }
    }
}

impl Evaluator for Rule {
    fn id(&self) -> &str {
        self.evaluator().id()
    }

    fn category(&self) -> RuleCategory {
        self.evaluator().category()
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        self.evaluator().evaluate(store, ctx)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The explicit rule table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    ids: HashSet<String>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. Ids must be non-empty and unique.
    pub fn register(&mut self, rule: Rule) -> Result<(), RuleRegistryError> {
        let id = rule.id().to_string();
        if id.trim().is_empty() {
            return Err(RuleRegistryError::EmptyId);
        }
        if self.ids.contains(&id) {
            return Err(RuleRegistryError::DuplicateId { id });
        }
        if self.rules.len() >= constants::MAX_RULES {
            return Err(RuleRegistryError::TooManyRules {
                count: self.rules.len() + 1,
                max: constants::MAX_RULES,
            });
        }
        tracing::debug!(rule = %id, category = %rule.category(), "Rule registered");
        self.ids.insert(id);
        self.rules.push(rule);
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Misbehaving rules for exercising engine isolation.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::model::{Severity, TimeSpan};

    #[derive(Debug, Clone)]
    pub struct PanickingRule {
        pub id: String,
    }

    impl Evaluator for PanickingRule {
        fn id(&self) -> &str {
            &self.id
        }

        fn category(&self) -> RuleCategory {
            RuleCategory::Anomaly
        }

        fn evaluate(
            &self,
            store: &EventStore,
            _: &EvalContext<'_>,
        ) -> Result<Vec<Finding>, RuleFailure> {
            let events = store.sorted();
            // One past the end.
            let event = &events[events.len()];
            Ok(vec![Finding::new(
                &self.id,
                RuleCategory::Anomaly,
                Severity::Low,
                TimeSpan::at(event.timestamp()),
                [event.id().clone()],
                "unreachable",
            )])
        }
    }
}
