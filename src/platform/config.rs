// Casetrail - platform/config.rs
//
// Platform directory resolution and config.toml loading with startup
// validation.
//
// Uses the `directories` crate for XDG (Linux), AppData (Windows),
// Library (macOS) compliance.
//
// Every analysis threshold comes from here. A rule table entry that is
// missing a required threshold, or carries an out-of-range one, is skipped
// with a warning rather than filled in with a guess.

use crate::core::discovery::DiscoveryConfig;
use crate::core::event_store::ViewScope;
use crate::core::model::{EventType, Severity, Source};
use crate::core::rules::malware::parse_indicator_list;
use crate::core::rules::{
    ActivityGapRule, BurstRule, ClockJumpRule, DeleteRecreateRule, DivergentDuplicateRule,
    FutureTimestampRule, HourWindow, IndicatorRule, MatchMode, PostDeletionActivityRule, Rule,
    UnattestedOriginRule, UnusualHoursRule,
};
use crate::core::timestamp::parse_canonical;
use crate::util::constants;
use crate::util::error::ConfigError;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Resolved platform paths for Casetrail configuration and data.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// Configuration directory (e.g. ~/.config/casetrail/ or %APPDATA%\Casetrail\)
    pub config_dir: PathBuf,

    /// Data directory (default log file location).
    pub data_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve platform-appropriate paths.
    ///
    /// Falls back to the current directory if platform dirs cannot be determined.
    pub fn resolve() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("", "", constants::APP_ID) {
            let config_dir = proj_dirs.config_dir().to_path_buf();
            let data_dir = proj_dirs.data_dir().to_path_buf();
            tracing::debug!(
                config = %config_dir.display(),
                data = %data_dir.display(),
                "Platform paths resolved"
            );
            Self {
                config_dir,
                data_dir,
            }
        } else {
            tracing::warn!("Could not determine platform directories, using current directory");
            let fallback = PathBuf::from(".");
            Self {
                config_dir: fallback.clone(),
                data_dir: fallback,
            }
        }
    }

    /// Default location of config.toml.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(constants::CONFIG_FILE_NAME)
    }
}

// =============================================================================
// Raw config.toml shape
// =============================================================================

/// Raw deserialisable shape of config.toml.
///
/// Unknown keys are silently ignored for forward compatibility.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub pipeline: PipelineSection,
    pub analysis: AnalysisSection,
    pub timeline: TimelineSection,
    pub evidence: EvidenceSection,
    pub logging: LoggingSection,
    pub rules: RulesSection,
}

/// `[pipeline]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Worker threads for hashing and rule evaluation (0 = auto).
    pub worker_threads: Option<usize>,
    /// Files at or above this size are hashed via a memory map.
    pub mmap_threshold_bytes: Option<u64>,
}

/// `[analysis]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    /// Device UTC offset used to compute local hours.
    pub utc_offset_minutes: Option<i32>,
}

/// `[timeline]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct TimelineSection {
    /// Gap marker threshold. No gap pass when absent.
    pub gap_threshold_secs: Option<i64>,
}

/// `[evidence]` config section (directory recording).
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct EvidenceSection {
    pub max_depth: Option<usize>,
    pub max_files: Option<usize>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
}

/// `[logging]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: Option<String>,
    /// Log file path (empty = stderr only).
    pub file: Option<String>,
}

/// `[rules]`: one array of tables per rule kind.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RulesSection {
    pub burst: Vec<RawRule>,
    pub delete_recreate: Vec<RawRule>,
    pub unusual_hours: Vec<RawRule>,
    pub malware: Vec<RawRule>,
    pub clock_jump: Vec<RawRule>,
    pub activity_gap: Vec<RawRule>,
    pub divergent_duplicate: Vec<RawRule>,
    pub post_deletion_activity: Vec<RawRule>,
    pub future_timestamp: Vec<RawRule>,
    pub unattested_origin: Vec<RawRule>,
}

/// One rule table entry. Each kind reads the keys it needs.
#[derive(Debug, Default, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RawRule {
    pub id: Option<String>,
    pub severity: Option<String>,
    pub source: Option<String>,
    /// Inclusive lower time bound, canonical timestamp.
    pub from: Option<String>,
    /// Inclusive upper time bound, canonical timestamp.
    pub until: Option<String>,
    pub event_type: Option<String>,
    pub min_events: Option<usize>,
    pub window_secs: Option<i64>,
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
    pub max_interval_secs: Option<i64>,
    pub tolerance_secs: Option<i64>,
    pub threshold_secs: Option<i64>,
    pub reference: Option<String>,
    pub indicators: Option<Vec<String>>,
    pub indicator_file: Option<String>,
    pub match_mode: Option<String>,
}

// =============================================================================
// Validated config
// =============================================================================

/// Validated application configuration derived from `config.toml`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Worker threads (0 = CPU count).
    pub worker_threads: usize,
    pub mmap_threshold: u64,
    pub utc_offset: FixedOffset,
    pub gap_threshold_secs: Option<i64>,
    pub discovery: DiscoveryConfig,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Rules in table order: burst, delete_recreate, unusual_hours, malware,
    /// clock_jump, activity_gap, divergent_duplicate, post_deletion_activity,
    /// future_timestamp, unattested_origin.
    pub rules: Vec<Rule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_threads: constants::DEFAULT_WORKER_THREADS,
            mmap_threshold: constants::DEFAULT_MMAP_THRESHOLD,
            utc_offset: Utc.fix(),
            gap_threshold_secs: None,
            discovery: DiscoveryConfig::default(),
            log_level: None,
            log_file: None,
            rules: Vec::new(),
        }
    }
}

/// Load and validate a config file.
///
/// A missing file yields defaults with no warnings (no rules configured).
/// An unreadable or unparseable file yields defaults with a warning.
pub fn load_config(config_path: &Path) -> (AppConfig, Vec<String>) {
    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "No config.toml found; using defaults");
        return (AppConfig::default(), Vec::new());
    }

    let content = match std::fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(e) => {
            let err = ConfigError::Io {
                path: config_path.to_path_buf(),
                source: e,
            };
            let msg = format!("{err}. Using defaults.");
            tracing::warn!("{}", msg);
            return (AppConfig::default(), vec![msg]);
        }
    };

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    match parse_config(&content, base_dir) {
        Ok(loaded) => {
            tracing::info!(
                path = %config_path.display(),
                rules = loaded.0.rules.len(),
                "Loaded config.toml"
            );
            loaded
        }
        Err(e) => {
            let err = ConfigError::TomlParse {
                path: config_path.to_path_buf(),
                source: e,
            };
            let msg = format!(
                "{err}. Using defaults. See config.example.toml for the expected format."
            );
            tracing::warn!("{}", msg);
            (AppConfig::default(), vec![msg])
        }
    }
}

/// Parse and validate config text. Relative indicator file paths resolve
/// against `base_dir`.
pub fn parse_config(
    content: &str,
    base_dir: &Path,
) -> Result<(AppConfig, Vec<String>), toml::de::Error> {
    let raw: RawConfig = toml::from_str(content)?;
    Ok(validate(raw, base_dir))
}

fn validate(raw: RawConfig, base_dir: &Path) -> (AppConfig, Vec<String>) {
    let mut warnings: Vec<String> = Vec::new();
    let mut config = AppConfig::default();

    // -- Pipeline --
    if let Some(threads) = raw.pipeline.worker_threads {
        if threads <= constants::MAX_WORKER_THREADS {
            config.worker_threads = threads;
        } else {
            warnings.push(format!(
                "[pipeline] worker_threads = {threads} is out of range (0-{}). Using default (auto).",
                constants::MAX_WORKER_THREADS
            ));
        }
    }
    if let Some(bytes) = raw.pipeline.mmap_threshold_bytes {
        if bytes > 0 {
            config.mmap_threshold = bytes;
        } else {
            warnings.push(format!(
                "[pipeline] mmap_threshold_bytes must be positive. Using default ({}).",
                constants::DEFAULT_MMAP_THRESHOLD
            ));
        }
    }

    // -- Analysis --
    if let Some(minutes) = raw.analysis.utc_offset_minutes {
        let max = constants::MAX_UTC_OFFSET_MINUTES;
        let offset = (-max..=max)
            .contains(&minutes)
            .then(|| FixedOffset::east_opt(minutes * 60))
            .flatten();
        match offset {
            Some(offset) => config.utc_offset = offset,
            None => warnings.push(format!(
                "[analysis] utc_offset_minutes = {minutes} is out of range (-{max}-{max}). Using UTC."
            )),
        }
    }

    // -- Timeline --
    if let Some(secs) = raw.timeline.gap_threshold_secs {
        match check_secs("gap_threshold_secs", Some(secs), 1) {
            Ok(secs) => config.gap_threshold_secs = Some(secs),
            Err(e) => warnings.push(format!("[timeline] {e}. Gap annotation disabled.")),
        }
    }

    // -- Evidence discovery --
    if let Some(depth) = raw.evidence.max_depth {
        if (1..=constants::ABSOLUTE_MAX_DEPTH).contains(&depth) {
            config.discovery.max_depth = depth;
        } else {
            warnings.push(format!(
                "[evidence] max_depth = {depth} is out of range (1-{}). Using default ({}).",
                constants::ABSOLUTE_MAX_DEPTH,
                constants::DEFAULT_MAX_DEPTH,
            ));
        }
    }
    if let Some(files) = raw.evidence.max_files {
        if files > 0 {
            config.discovery.max_files = files;
        } else {
            warnings.push(format!(
                "[evidence] max_files must be positive. Using default ({}).",
                constants::DEFAULT_MAX_EVIDENCE_FILES
            ));
        }
    }
    if let Some(patterns) = raw.evidence.include_patterns {
        config.discovery.include_patterns = patterns;
    }
    if let Some(patterns) = raw.evidence.exclude_patterns {
        config.discovery.exclude_patterns = patterns;
    }

    // -- Logging: level --
    if let Some(ref level) = raw.logging.level {
        let valid = ["error", "warn", "info", "debug", "trace"];
        if valid.contains(&level.to_lowercase().as_str()) {
            config.log_level = Some(level.clone());
        } else {
            warnings.push(format!(
                "[logging] level = \"{level}\" is not recognised. \
                 Valid values: error, warn, info, debug, trace. Using default (info).",
            ));
        }
    }

    // -- Logging: file --
    if let Some(ref file) = raw.logging.file {
        if !file.is_empty() {
            config.log_file = Some(file.clone());
        }
    }

    // -- Rules --
    config.rules = build_rules(&raw.rules, base_dir, &mut warnings);

    if !warnings.is_empty() {
        tracing::warn!(
            count = warnings.len(),
            "Config validation produced warnings"
        );
    }

    (config, warnings)
}

// =============================================================================
// Rule tables
// =============================================================================

type Builder = fn(&RawRule, String, &Path) -> Result<Rule, String>;

fn build_rules(section: &RulesSection, base_dir: &Path, warnings: &mut Vec<String>) -> Vec<Rule> {
    let tables: [(&str, &[RawRule], Builder); 10] = [
        ("burst", section.burst.as_slice(), build_burst as Builder),
        ("delete_recreate", section.delete_recreate.as_slice(), build_delete_recreate as Builder),
        ("unusual_hours", section.unusual_hours.as_slice(), build_unusual_hours as Builder),
        ("malware", section.malware.as_slice(), build_malware as Builder),
        ("clock_jump", section.clock_jump.as_slice(), build_clock_jump as Builder),
        ("activity_gap", section.activity_gap.as_slice(), build_activity_gap as Builder),
        ("divergent_duplicate", section.divergent_duplicate.as_slice(), build_divergent_duplicate as Builder),
        ("post_deletion_activity", section.post_deletion_activity.as_slice(), build_post_deletion_activity as Builder),
        ("future_timestamp", section.future_timestamp.as_slice(), build_future_timestamp as Builder),
        ("unattested_origin", section.unattested_origin.as_slice(), build_unattested_origin as Builder),
    ];

    let mut rules = Vec::new();
    for (kind, entries, build) in tables {
        for (index, raw) in entries.iter().enumerate() {
            let id = match raw.id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("{kind}-{}", index + 1),
            };
            match build(raw, id.clone(), base_dir) {
                Ok(rule) => rules.push(rule),
                Err(e) => warnings.push(format!(
                    "[[rules.{kind}]] '{id}': {e}. Rule skipped."
                )),
            }
        }
    }
    rules
}

fn check_secs(field: &str, value: Option<i64>, min: i64) -> Result<i64, String> {
    let secs = value.ok_or_else(|| format!("{field} is required"))?;
    if secs < min || secs > constants::MAX_CONFIGURED_SPAN_SECS {
        return Err(format!(
            "{field} = {secs} is out of range ({min}-{})",
            constants::MAX_CONFIGURED_SPAN_SECS
        ));
    }
    Ok(secs)
}

fn severity(raw: &RawRule, default: Severity) -> Result<Severity, String> {
    match &raw.severity {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| format!("severity \"{s}\" is not one of info, low, medium, high")),
    }
}

fn source(raw: &RawRule) -> Result<Option<Source>, String> {
    raw.source
        .as_deref()
        .map(|s| {
            s.to_uppercase()
                .parse::<Source>()
                .map_err(|_| format!("source \"{s}\" is not one of SMS, CALL, MEDIA, APP"))
        })
        .transpose()
}

fn instant(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    value
        .map(|v| parse_canonical(v).map_err(|e| format!("{field}: {e}")))
        .transpose()
}

fn scope(raw: &RawRule) -> Result<ViewScope, String> {
    let scope = ViewScope {
        source: source(raw)?,
        from: instant("from", raw.from.as_deref())?,
        until: instant("until", raw.until.as_deref())?,
    };
    if let (Some(from), Some(until)) = (scope.from, scope.until) {
        if from > until {
            return Err("from is later than until".to_string());
        }
    }
    Ok(scope)
}

fn hours(raw: &RawRule) -> Result<Option<HourWindow>, String> {
    match (raw.start_hour, raw.end_hour) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => {
            let window = HourWindow { start, end };
            window.validate().map_err(|e| e.to_string())?;
            Ok(Some(window))
        }
        _ => Err("start_hour and end_hour must be given together".to_string()),
    }
}

fn build_burst(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let scope = scope(raw)?;
    let source = scope.source.ok_or("source is required")?;
    let min_events = raw.min_events.ok_or("min_events is required")?;
    if min_events < 2 {
        return Err(format!("min_events = {min_events} must be at least 2"));
    }
    let window = check_secs("window_secs", raw.window_secs, 1)?;

    let mut rule = BurstRule::new(id, source, min_events, window)
        .with_severity(severity(raw, Severity::Medium)?);
    rule.scope = scope;
    if let Some(t) = &raw.event_type {
        let event_type: EventType = t
            .to_lowercase()
            .parse()
            .map_err(|_| format!("event_type \"{t}\" is not a known event type"))?;
        rule = rule.with_event_type(event_type);
    }
    if let Some(h) = hours(raw)? {
        rule = rule.with_hours(h);
    }
    Ok(Rule::Burst(rule))
}

fn build_delete_recreate(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let interval = check_secs("max_interval_secs", raw.max_interval_secs, 0)?;
    Ok(Rule::DeleteRecreate(
        DeleteRecreateRule::new(id, interval)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::Medium)?),
    ))
}

fn build_unusual_hours(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let window = hours(raw)?.ok_or("start_hour and end_hour are required")?;
    let min_events = raw.min_events.ok_or("min_events is required")?;
    if min_events == 0 {
        return Err("min_events must be at least 1".to_string());
    }
    Ok(Rule::UnusualHours(
        UnusualHoursRule::new(id, window, min_events)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::Low)?),
    ))
}

fn build_malware(raw: &RawRule, id: String, base_dir: &Path) -> Result<Rule, String> {
    let mut indicators: Vec<String> = raw.indicators.clone().unwrap_or_default();
    if let Some(file) = &raw.indicator_file {
        let path = base_dir.join(file);
        indicators.extend(read_indicator_file(&path)?);
    }
    if indicators.is_empty() {
        return Err("indicators or indicator_file is required".to_string());
    }
    if indicators.len() > constants::MAX_INDICATORS_PER_RULE {
        return Err(format!(
            "{} indicators exceeds the limit of {}",
            indicators.len(),
            constants::MAX_INDICATORS_PER_RULE
        ));
    }
    if let Some(short) = indicators
        .iter()
        .find(|i| i.trim().chars().count() < constants::MIN_INDICATOR_LEN)
    {
        return Err(format!(
            "indicator \"{short}\" is shorter than {} characters",
            constants::MIN_INDICATOR_LEN
        ));
    }
    let mode = match &raw.match_mode {
        Some(m) => m.parse::<MatchMode>()?,
        None => MatchMode::default(),
    };
    let scope = scope(raw)?;
    if scope.source.is_some_and(|s| s != Source::App) {
        return Err("malware rules only apply to APP events".to_string());
    }
    Ok(Rule::Indicator(
        IndicatorRule::new(id, indicators)
            .with_mode(mode)
            .with_scope(scope)
            .with_severity(severity(raw, Severity::High)?),
    ))
}

fn read_indicator_file(path: &Path) -> Result<Vec<String>, String> {
    let size = std::fs::metadata(path)
        .map_err(|e| format!("indicator_file '{}': {e}", path.display()))?
        .len();
    if size > constants::MAX_INDICATOR_FILE_SIZE {
        return Err(format!(
            "indicator_file '{}' is {size} bytes, exceeds maximum of {}",
            path.display(),
            constants::MAX_INDICATOR_FILE_SIZE
        ));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("indicator_file '{}': {e}", path.display()))?;
    Ok(parse_indicator_list(&content))
}

fn build_clock_jump(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let tolerance = check_secs("tolerance_secs", raw.tolerance_secs, 0)?;
    Ok(Rule::ClockJump(
        ClockJumpRule::new(id, tolerance)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::High)?),
    ))
}

fn build_activity_gap(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let threshold = check_secs("threshold_secs", raw.threshold_secs, 1)?;
    Ok(Rule::ActivityGap(
        ActivityGapRule::new(id, threshold)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::Medium)?),
    ))
}

fn build_divergent_duplicate(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    Ok(Rule::DivergentDuplicate(
        DivergentDuplicateRule::new(id, severity(raw, Severity::Medium)?).with_scope(scope(raw)?),
    ))
}

fn build_post_deletion_activity(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let window = check_secs("window_secs", raw.window_secs, 1)?;
    Ok(Rule::PostDeletionActivity(
        PostDeletionActivityRule::new(id, window)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::High)?),
    ))
}

fn build_future_timestamp(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    let reference = instant("reference", raw.reference.as_deref())?
        .ok_or("reference is required (the acquisition time, canonical format)")?;
    let tolerance = check_secs("tolerance_secs", Some(raw.tolerance_secs.unwrap_or(0)), 0)?;
    Ok(Rule::FutureTimestamp(
        FutureTimestampRule::new(id, reference, tolerance)
            .with_scope(scope(raw)?)
            .with_severity(severity(raw, Severity::High)?),
    ))
}

fn build_unattested_origin(raw: &RawRule, id: String, _: &Path) -> Result<Rule, String> {
    Ok(Rule::UnattestedOrigin(UnattestedOriginRule::new(
        id,
        severity(raw, Severity::Medium)?,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::Evaluator;

    fn parse(content: &str) -> (AppConfig, Vec<String>) {
        parse_config(content, Path::new(".")).unwrap()
    }

    #[test]
    fn test_empty_config_has_no_rules_and_no_gap_pass() {
        let (config, warnings) = parse("");
        assert!(config.rules.is_empty());
        assert_eq!(config.gap_threshold_secs, None);
        assert_eq!(config.worker_threads, 0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_full_rule_set_is_built_in_table_order() {
        let (config, warnings) = parse(
            r#"
            [pipeline]
            worker_threads = 4

            [analysis]
            utc_offset_minutes = 120

            [timeline]
            gap_threshold_secs = 300

            [[rules.burst]]
            id = "night-calls"
            source = "CALL"
            event_type = "outgoing"
            min_events = 5
            window_secs = 600
            start_hour = 22
            end_hour = 5

            [[rules.malware]]
            indicators = ["com.suspicious.app"]
            match_mode = "exact"

            [[rules.activity_gap]]
            threshold_secs = 86400
            severity = "HIGH"

            [[rules.unattested_origin]]
            "#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.utc_offset.local_minus_utc(), 7200);
        assert_eq!(config.gap_threshold_secs, Some(300));

        let ids: Vec<&str> = config.rules.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["night-calls", "malware-1", "activity_gap-1", "unattested_origin-1"]);
        let Rule::ActivityGap(gap) = &config.rules[2] else {
            panic!("expected activity gap rule");
        };
        assert_eq!(gap.severity, Severity::High);
    }

    #[test]
    fn test_invalid_rules_are_skipped_with_warnings() {
        let (config, warnings) = parse(
            r#"
            [[rules.burst]]
            id = "no-source"
            min_events = 3
            window_secs = 60

            [[rules.burst]]
            id = "one-event"
            source = "SMS"
            min_events = 1
            window_secs = 60

            [[rules.activity_gap]]
            id = "no-threshold"

            [[rules.malware]]
            id = "tiny"
            indicators = ["ab"]

            [[rules.clock_jump]]
            id = "ok"
            tolerance_secs = 0
            "#,
        );
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].id(), "ok");
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("'no-threshold'") && w.contains("threshold_secs is required")));
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let (config, warnings) = parse(
            r#"
            [pipeline]
            worker_threads = 100000
            [analysis]
            utc_offset_minutes = 5000
            [timeline]
            gap_threshold_secs = 0
            [logging]
            level = "loud"
            "#,
        );
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.utc_offset.local_minus_utc(), 0);
        assert_eq!(config.gap_threshold_secs, None);
        assert_eq!(config.log_level, None);
        assert_eq!(warnings.len(), 4);
    }

    #[test]
    fn test_indicator_file_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("iocs.txt"), "# spyware\ncom.evil.spy\n").unwrap();
        let (config, warnings) = parse_config(
            r#"
            [[rules.malware]]
            id = "iocs"
            indicators = ["com.suspicious.app"]
            indicator_file = "iocs.txt"
            "#,
            dir.path(),
        )
        .unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        let Rule::Indicator(rule) = &config.rules[0] else {
            panic!("expected indicator rule");
        };
        assert_eq!(rule.indicators(), ["com.evil.spy", "com.suspicious.app"]);
    }

    #[test]
    fn test_post_deletion_activity_table() {
        let (config, warnings) = parse(
            r#"
            [[rules.post_deletion_activity]]
            source = "MEDIA"
            window_secs = 3600

            [[rules.post_deletion_activity]]
            id = "no-window"
            "#,
        );
        assert_eq!(config.rules.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'no-window'") && warnings[0].contains("window_secs is required"));
        let Rule::PostDeletionActivity(rule) = &config.rules[0] else {
            panic!("expected post-deletion activity rule");
        };
        assert_eq!(rule.id, "post_deletion_activity-1");
        assert_eq!(rule.window_secs, 3600);
        assert_eq!(rule.scope.source, Some(Source::Media));
        assert_eq!(rule.severity, Severity::High);
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let (config, warnings) = load_config(Path::new("/nonexistent/casetrail/config.toml"));
        assert!(config.rules.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unparseable_config_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline\nworker_threads = ").unwrap();
        let (config, warnings) = load_config(&path);
        assert!(config.rules.is_empty());
        assert_eq!(warnings.len(), 1);
    }
}
