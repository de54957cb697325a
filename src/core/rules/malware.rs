// Casetrail - core/rules/malware.rs
//
// Malware-indicator rule: APP events whose details contain a configured
// indicator (package name, file name, domain).

use super::{text, validate_scope, EvalContext, Evaluator, RuleFailure};
use crate::core::event_store::{EventStore, ViewScope};
use crate::core::model::{Finding, RuleCategory, Severity, Source, TimeSpan};
use crate::util::constants;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How an indicator is compared against event details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Case-insensitive substring.
    #[default]
    Substring,
    /// Case-insensitive whole token.
    Exact,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Substring => f.write_str("substring"),
            MatchMode::Exact => f.write_str("exact"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "substring" => Ok(MatchMode::Substring),
            "exact" => Ok(MatchMode::Exact),
            other => Err(format!("unknown match mode '{other}' (expected substring or exact)")),
        }
    }
}

/// Matches APP events against an indicator list.
///
/// Indicators are lowercased, trimmed and de-duplicated on construction so
/// the matched list in an explanation is always in the same order.
#[derive(Debug, Clone)]
pub struct IndicatorRule {
    pub id: String,
    pub severity: Severity,
    pub mode: MatchMode,
    /// Time bounds only; the source is always APP.
    pub scope: ViewScope,
    indicators: Vec<String>,
}

impl IndicatorRule {
    pub fn new<I, S>(id: impl Into<String>, indicators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let indicators: BTreeSet<String> = indicators
            .into_iter()
            .map(|s| s.as_ref().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            id: id.into(),
            severity: Severity::High,
            mode: MatchMode::Substring,
            scope: ViewScope::default(),
            indicators: indicators.into_iter().collect(),
        }
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_scope(mut self, scope: ViewScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn indicators(&self) -> &[String] {
        &self.indicators
    }

    fn validate(&self) -> Result<(), RuleFailure> {
        validate_scope(&self.scope)?;
        if self.indicators.is_empty() {
            return Err(RuleFailure::Misconfigured("indicator list is empty".to_string()));
        }
        if self.indicators.len() > constants::MAX_INDICATORS_PER_RULE {
            return Err(RuleFailure::Misconfigured(format!(
                "{} indicators exceeds the limit of {}",
                self.indicators.len(),
                constants::MAX_INDICATORS_PER_RULE
            )));
        }
        // Very short indicators match nearly everything in substring mode.
        if let Some(short) = self
            .indicators
            .iter()
            .find(|i| i.chars().count() < constants::MIN_INDICATOR_LEN)
        {
            return Err(RuleFailure::Misconfigured(format!(
                "indicator '{short}' is shorter than {} characters",
                constants::MIN_INDICATOR_LEN
            )));
        }
        Ok(())
    }

    fn matches<'a>(&'a self, details: &str) -> Vec<&'a str> {
        match self.mode {
            MatchMode::Substring => {
                let haystack = details.to_lowercase();
                self.indicators
                    .iter()
                    .filter(|i| haystack.contains(i.as_str()))
                    .map(String::as_str)
                    .collect()
            }
            MatchMode::Exact => {
                let tokens: BTreeSet<String> = text::tokens(details).into_iter().collect();
                self.indicators
                    .iter()
                    .filter(|i| tokens.contains(i.as_str()))
                    .map(String::as_str)
                    .collect()
            }
        }
    }
}

impl Evaluator for IndicatorRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::MalwareIndicator
    }

    fn evaluate(
        &self,
        store: &EventStore,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<Finding>, RuleFailure> {
        self.validate()?;

        let scope = ViewScope {
            source: Some(Source::App),
            ..self.scope
        };

        let mut findings = Vec::new();
        for event in store.view(scope) {
            ctx.checkpoint()?;
            let matched = self.matches(event.details());
            if matched.is_empty() {
                continue;
            }
            let quoted: Vec<String> = matched.iter().map(|m| format!("\"{m}\"")).collect();
            let noun = if matched.len() == 1 { "indicator" } else { "indicators" };
            findings.push(Finding::new(
                &self.id,
                RuleCategory::MalwareIndicator,
                self.severity,
                TimeSpan::at(event.timestamp()),
                [event.id().clone()],
                format!(
                    "APP {} event \"{}\" matched {noun} {} ({} match)",
                    event.event_type(),
                    event.details(),
                    quoted.join(", "),
                    self.mode
                ),
            ));
        }
        Ok(findings)
    }
}

/// Parse an indicator list file: one indicator per line, blank lines and
/// lines starting with `#` ignored.
pub fn parse_indicator_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
