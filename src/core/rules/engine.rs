// Casetrail - core/rules/engine.rs
//
// Runs every registered rule over a shared read-only Event Store.
//
// Rules are evaluated in parallel on whatever rayon pool the caller has
// installed; the pipeline bounds it with its configured worker count.
// Each rule is isolated: an error or panic in one becomes a
// RuleEvaluationError and the remaining rules still produce output.
// Results are sorted afterwards, so the output never depends on which
// worker finished first.

use super::{EvalContext, Evaluator, Rule, RuleFailure, RuleRegistry};
use crate::core::diagnostics::RuleEvaluationError;
use crate::core::event_store::EventStore;
use crate::core::model::Finding;
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Output of one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Findings from every rule that succeeded, in finding order.
    pub findings: Vec<Arc<Finding>>,
    /// One entry per rule that failed, sorted by rule id.
    pub errors: Vec<RuleEvaluationError>,
}

impl Analysis {
    /// True when at least one rule failed.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The run was cancelled; any partial output has been discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Evaluates a fixed rule table.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    registry: RuleRegistry,
}

impl RuleEngine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Evaluate every rule against `store`.
    pub fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Analysis, Cancelled> {
        tracing::info!(
            rules = self.registry.len(),
            events = store.len(),
            "Rule evaluation started"
        );

        let results: Vec<(&Rule, Result<Vec<Finding>, RuleFailure>)> = self
            .registry
            .rules()
            .par_iter()
            .map(|rule| (rule, evaluate_isolated(rule, store, ctx)))
            .collect();

        if ctx.cancel.is_cancelled() {
            tracing::warn!("Rule evaluation cancelled; partial output discarded");
            return Err(Cancelled);
        }

        let mut analysis = Analysis::default();
        for (rule, result) in results {
            match result.and_then(|findings| checked(findings, rule)) {
                Ok(findings) => {
                    tracing::debug!(rule = rule.id(), findings = findings.len(), "Rule evaluated");
                    analysis
                        .findings
                        .extend(findings.into_iter().map(Arc::new));
                }
                Err(failure) => {
                    tracing::warn!(rule = rule.id(), reason = %failure, "Rule evaluation failed");
                    analysis.errors.push(RuleEvaluationError {
                        rule_id: rule.id().to_string(),
                        reason: failure.to_string(),
                    });
                }
            }
        }

        analysis
            .findings
            .sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        analysis.errors.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

        tracing::info!(
            findings = analysis.findings.len(),
            failed_rules = analysis.errors.len(),
            "Rule evaluation complete"
        );
        Ok(analysis)
    }
}

/// Run one rule, converting a panic into a failure.
fn evaluate_isolated(
    rule: &Rule,
    store: &EventStore,
    ctx: &EvalContext<'_>,
) -> Result<Vec<Finding>, RuleFailure> {
    panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(store, ctx)))
        .unwrap_or_else(|payload| Err(RuleFailure::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Every finding must cite evidence and carry the id of the rule that
/// produced it.
fn checked(findings: Vec<Finding>, rule: &Rule) -> Result<Vec<Finding>, RuleFailure> {
    if let Some(bad) = findings
        .iter()
        .find(|f| f.evidence_refs().is_empty() || f.rule_id() != rule.id())
    {
        return Err(RuleFailure::InvalidOutput(format!(
            "finding at {} has no evidence or a foreign rule id",
            bad.span()
        )));
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::core::event_store::EventStoreBuilder;
    use crate::core::manifest::Manifest;
    use crate::core::model::{Event, EventType, Severity, Source};
    use crate::core::rules::{BurstRule, DivergentDuplicateRule, IndicatorRule};
    use crate::core::timestamp::parse_canonical;

    fn store() -> EventStore {
        let mut builder = EventStoreBuilder::new();
        for (ts, source, details) in [
            ("2024-01-01 10:00:00", Source::App, "installed com.suspicious.app"),
            ("2024-01-01 10:00:00", Source::App, "installed com.other.app"),
            ("2024-01-01 10:00:10", Source::Sms, "one"),
            ("2024-01-01 10:00:20", Source::Sms, "two"),
        ] {
            builder.push(Event::new(
                parse_canonical(ts).unwrap(),
                source,
                EventType::Created,
                details,
                "events.json",
            ));
        }
        builder.build().0
    }

    fn registry(rules: Vec<Rule>) -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        for rule in rules {
            registry.register(rule).unwrap();
        }
        registry
    }

    #[test]
    fn test_one_failing_rule_degrades_without_hiding_others() {
        let engine = RuleEngine::new(registry(vec![
            Rule::Indicator(IndicatorRule::new("malware", ["com.suspicious.app"])),
            // min_events below 2 is rejected at evaluation time.
            Rule::Burst(BurstRule::new("broken-burst", Source::Sms, 1, 60)),
            Rule::DivergentDuplicate(DivergentDuplicateRule::new("dup", Severity::Medium)),
        ]));
        let manifest = Manifest::new();
        let cancel = CancelToken::new();
        let analysis = engine
            .evaluate(&store(), &EvalContext::new(&manifest, &cancel))
            .unwrap();

        assert!(analysis.is_degraded());
        assert_eq!(analysis.errors.len(), 1);
        assert_eq!(analysis.errors[0].rule_id, "broken-burst");
        let ids: Vec<&str> = analysis.findings.iter().map(|f| f.rule_id()).collect();
        assert_eq!(ids, vec!["dup", "malware"]);
    }

    #[test]
    fn test_panicking_rule_is_isolated() {
        use crate::core::rules::testing::PanickingRule;

        let engine = RuleEngine::new(registry(vec![
            Rule::Panicking(PanickingRule { id: "out-of-range".to_string() }),
            Rule::Indicator(IndicatorRule::new("malware", ["com.suspicious.app"])),
            Rule::DivergentDuplicate(DivergentDuplicateRule::new("dup", Severity::Medium)),
        ]));
        let manifest = Manifest::new();
        let cancel = CancelToken::new();
        let analysis = engine
            .evaluate(&store(), &EvalContext::new(&manifest, &cancel))
            .unwrap();

        assert!(analysis.is_degraded());
        assert_eq!(analysis.errors.len(), 1);
        assert_eq!(analysis.errors[0].rule_id, "out-of-range");
        assert!(
            analysis.errors[0].reason.starts_with("panicked: index out of bounds"),
            "{}",
            analysis.errors[0].reason
        );
        let ids: Vec<&str> = analysis.findings.iter().map(|f| f.rule_id()).collect();
        assert_eq!(ids, vec!["dup", "malware"]);
    }

    #[test]
    fn test_output_is_deterministic() {
        let engine = RuleEngine::new(registry(vec![
            Rule::Burst(BurstRule::new("burst", Source::Sms, 2, 60)),
            Rule::Indicator(IndicatorRule::new("malware", ["app"])),
            Rule::DivergentDuplicate(DivergentDuplicateRule::new("dup", Severity::Low)),
        ]));
        let manifest = Manifest::new();
        let cancel = CancelToken::new();
        let ctx = EvalContext::new(&manifest, &cancel);
        let s = store();
        let first = engine.evaluate(&s, &ctx).unwrap();
        for _ in 0..10 {
            let again = engine.evaluate(&s, &ctx).unwrap();
            assert_eq!(again.findings, first.findings);
        }
    }

    #[test]
    fn test_cancelled_run_discards_output() {
        let engine = RuleEngine::new(registry(vec![Rule::Indicator(IndicatorRule::new(
            "malware",
            ["com.suspicious.app"],
        ))]));
        let manifest = Manifest::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = engine.evaluate(&store(), &EvalContext::new(&manifest, &cancel));
        assert_eq!(result.map(|a| a.findings.len()), Err(Cancelled));
    }

    #[test]
    fn test_panic_message_extraction() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }
}
