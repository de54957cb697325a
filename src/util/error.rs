// Casetrail - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// No string-based error propagation.
// All errors preserve the causal chain for diagnostic logging.
//
// Recoverable per-record and per-rule problems (schema violations, rule
// evaluation failures, gap warnings) are NOT errors in this sense: they are
// diagnostics data and live in core::diagnostics.

use crate::core::manifest::IntegrityViolation;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all Casetrail operations.
/// Errors are categorised by the subsystem that produced them.
#[derive(Debug)]
pub enum CasetrailError {
    /// An event file could not be ingested at all.
    Ingest(IngestError),

    /// Evidence digest did not match its baseline. Always fatal.
    Integrity(IntegrityViolation),

    /// The persisted manifest could not be read or appended.
    Ledger(LedgerError),

    /// Rule registration failed.
    Registry(RuleRegistryError),

    /// Export operation failed.
    Export(ExportError),

    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// Evidence discovery failed.
    Discovery(DiscoveryError),

    /// The bounded worker pool could not be created.
    WorkerPool(rayon::ThreadPoolBuildError),

    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for CasetrailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest(e) => write!(f, "Ingest error: {e}"),
            Self::Integrity(e) => write!(f, "Integrity violation: {e}"),
            Self::Ledger(e) => write!(f, "Ledger error: {e}"),
            Self::Registry(e) => write!(f, "Rule registry error: {e}"),
            Self::Export(e) => write!(f, "Export error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Discovery(e) => write!(f, "Discovery error: {e}"),
            Self::WorkerPool(e) => write!(f, "Worker pool error: {e}"),
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for CasetrailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ingest(e) => Some(e),
            Self::Integrity(e) => Some(e),
            Self::Ledger(e) => Some(e),
            Self::Registry(e) => Some(e),
            Self::Export(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Discovery(e) => Some(e),
            Self::WorkerPool(e) => Some(e),
            Self::Io { source, .. } => Some(source),
        }
    }
}

impl From<IntegrityViolation> for CasetrailError {
    fn from(e: IntegrityViolation) -> Self {
        Self::Integrity(e)
    }
}

impl From<rayon::ThreadPoolBuildError> for CasetrailError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Self::WorkerPool(e)
    }
}

// ---------------------------------------------------------------------------
// Ingest errors
// ---------------------------------------------------------------------------

/// File-level ingestion failures. A file that fails here contributes no
/// events; other files in the same run are unaffected.
#[derive(Debug)]
pub enum IngestError {
    /// The event file could not be read.
    Io { path: PathBuf, source: io::Error },

    /// The event file is not valid JSON.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The top-level JSON value is not an array of records.
    NotAnArray { path: PathBuf, found: &'static str },

    /// The event file exceeds the maximum accepted size.
    FileTooLarge { path: PathBuf, size: u64, max: u64 },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Cannot read event file '{}': {source}", path.display())
            }
            Self::Json { path, source } => {
                write!(f, "Event file '{}' is not valid JSON: {source}", path.display())
            }
            Self::NotAnArray { path, found } => write!(
                f,
                "Event file '{}' must contain a JSON array of records, found {found}",
                path.display()
            ),
            Self::FileTooLarge { path, size, max } => write!(
                f,
                "Event file '{}' is {size} bytes, exceeds maximum of {max} bytes",
                path.display()
            ),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<IngestError> for CasetrailError {
    fn from(e: IngestError) -> Self {
        Self::Ingest(e)
    }
}

// ---------------------------------------------------------------------------
// Ledger errors
// ---------------------------------------------------------------------------

/// Errors reading or appending the persisted manifest. These are distinct
/// from integrity violations: the evidence may be fine, the log is not.
#[derive(Debug)]
pub enum LedgerError {
    /// The manifest file could not be opened, read, or appended.
    ManifestIo { path: PathBuf, source: io::Error },

    /// A manifest line is not a valid HashRecord.
    ManifestParse {
        path: PathBuf,
        line_number: usize,
        source: serde_json::Error,
    },

    /// A HashRecord could not be serialised for appending.
    Serialize { source: serde_json::Error },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManifestIo { path, source } => {
                write!(f, "Manifest I/O error '{}': {source}", path.display())
            }
            Self::ManifestParse {
                path,
                line_number,
                source,
            } => write!(
                f,
                "Manifest '{}' line {line_number} is not a valid hash record: {source}",
                path.display()
            ),
            Self::Serialize { source } => write!(f, "Cannot serialise hash record: {source}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ManifestIo { source, .. } => Some(source),
            Self::ManifestParse { source, .. } => Some(source),
            Self::Serialize { source } => Some(source),
        }
    }
}

impl From<LedgerError> for CasetrailError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

// ---------------------------------------------------------------------------
// Rule registry errors
// ---------------------------------------------------------------------------

/// Errors building the rule table at startup.
#[derive(Debug)]
pub enum RuleRegistryError {
    /// Two rules were registered under the same id.
    DuplicateId { id: String },

    /// A rule was registered with an empty id.
    EmptyId,

    /// Maximum number of rules exceeded.
    TooManyRules { count: usize, max: usize },
}

impl fmt::Display for RuleRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId { id } => write!(f, "Rule id '{id}' is registered twice"),
            Self::EmptyId => write!(f, "Rule id must not be empty"),
            Self::TooManyRules { count, max } => {
                write!(f, "Too many rules registered ({count}), maximum is {max}")
            }
        }
    }
}

impl std::error::Error for RuleRegistryError {}

impl From<RuleRegistryError> for CasetrailError {
    fn from(e: RuleRegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Export errors
// ---------------------------------------------------------------------------

/// Errors related to export operations.
#[derive(Debug)]
pub enum ExportError {
    /// I/O error writing the export file.
    Io { path: PathBuf, source: io::Error },

    /// CSV serialisation error.
    Csv { path: PathBuf, source: csv::Error },

    /// JSON serialisation error.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// An export would replace a file that already exists.
    TargetExists { path: PathBuf },

    /// The custody manifest already has records for this export path from
    /// an earlier run.
    AlreadyRecorded { path: PathBuf },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Export I/O error '{}': {source}", path.display())
            }
            Self::Csv { path, source } => {
                write!(f, "CSV export error '{}': {source}", path.display())
            }
            Self::Json { path, source } => {
                write!(f, "JSON export error '{}': {source}", path.display())
            }
            Self::TargetExists { path } => write!(
                f,
                "Export target '{}' already exists; reports are never overwritten",
                path.display()
            ),
            Self::AlreadyRecorded { path } => write!(
                f,
                "Export target '{}' already has records in the custody manifest; \
                 write this run to a new output directory",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Csv { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
            Self::TargetExists { .. } | Self::AlreadyRecorded { .. } => None,
        }
    }
}

impl From<ExportError> for CasetrailError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing failed.
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// I/O error reading config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TomlParse { path, source } => {
                write!(f, "Config parse error '{}': {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TomlParse { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for CasetrailError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Discovery errors
// ---------------------------------------------------------------------------

/// Errors related to evidence tree discovery.
#[derive(Debug)]
pub enum DiscoveryError {
    /// The evidence root does not exist or is not accessible.
    RootNotFound { path: PathBuf },

    /// The evidence root is not a directory.
    NotADirectory { path: PathBuf },

    /// Maximum file count exceeded during discovery.
    MaxFilesExceeded { max: usize },

    /// Walkdir traversal error on the root itself.
    Traversal {
        path: PathBuf,
        source: walkdir::Error,
    },
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootNotFound { path } => {
                write!(f, "Evidence path '{}' does not exist", path.display())
            }
            Self::NotADirectory { path } => {
                write!(f, "Evidence path '{}' is not a directory", path.display())
            }
            Self::MaxFilesExceeded { max } => write!(
                f,
                "Discovery stopped: exceeded maximum of {max} evidence files. \
                 Record sub-directories separately."
            ),
            Self::Traversal { path, source } => {
                write!(f, "Error traversing '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Traversal { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DiscoveryError> for CasetrailError {
    fn from(e: DiscoveryError) -> Self {
        Self::Discovery(e)
    }
}

/// Convenience type alias for Casetrail results.
pub type Result<T> = std::result::Result<T, CasetrailError>;
