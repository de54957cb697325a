// Casetrail - core/discovery.rs
//
// Recursive evidence tree traversal for recording a whole acquisition
// directory in the custody manifest.
//
// Reads directory metadata only, never file contents; hashing belongs to
// app::custody. Unlike a log scanner, evidence discovery never silently
// drops files: exceeding the file limit is an error, and the result is
// sorted by path so the same tree always records in the same order.

use crate::util::constants;
use crate::util::error::DiscoveryError;
use std::path::{Path, PathBuf};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum directory recursion depth.
    pub max_depth: usize,

    /// Maximum number of files before discovery fails.
    pub max_files: usize,

    /// Glob patterns (filename-only) a file must match. Empty = everything.
    pub include_patterns: Vec<String>,

    /// Glob patterns matched against filenames and directory names.
    /// Literal patterns also prune whole directories.
    pub exclude_patterns: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: constants::DEFAULT_MAX_DEPTH,
            max_files: constants::DEFAULT_MAX_EVIDENCE_FILES,
            include_patterns: Vec::new(),
            exclude_patterns: constants::DEFAULT_EVIDENCE_EXCLUDE_PATTERNS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// One evidence file found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEvidence {
    pub path: PathBuf,
    pub size: u64,
}

// =============================================================================
// Discovery
// =============================================================================

/// Discover evidence files under `root`.
///
/// Entries that cannot be accessed and symbolic links are skipped and
/// reported in the returned warnings. Returns `Err` when the root is
/// invalid or the file limit is exceeded.
pub fn discover_evidence(
    root: &Path,
    config: &DiscoveryConfig,
) -> Result<(Vec<DiscoveredEvidence>, Vec<String>), DiscoveryError> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(DiscoveryError::NotADirectory {
                path: root.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(DiscoveryError::RootNotFound {
                path: root.to_path_buf(),
            })
        }
    }

    let max_depth = config.max_depth.min(constants::ABSOLUTE_MAX_DEPTH);
    let include_pats = compile_patterns(&config.include_patterns, "include");
    let exclude_pats = compile_patterns(&config.exclude_patterns, "exclude");

    tracing::debug!(
        root = %root.display(),
        max_depth,
        max_files = config.max_files,
        include = ?config.include_patterns,
        exclude = ?config.exclude_patterns,
        "Evidence discovery starting"
    );

    let mut files: Vec<DiscoveredEvidence> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let walker = walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            let name = e.file_name().to_str().unwrap_or("");
            !is_excluded_component(name, &exclude_pats)
        });

    for entry_result in walker {
        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(DiscoveryError::Traversal {
                        path: root.to_path_buf(),
                        source: e,
                    });
                }
                let path_str = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unknown>".to_string());
                let msg = format!("Cannot access '{path_str}': {e}");
                tracing::warn!(warning = %msg, "Discovery warning");
                warnings.push(msg);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path();
        if file_type.is_symlink() {
            warnings.push(format!("Skipping symbolic link '{}'", path.display()));
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            warnings.push(format!("Skipping '{}': non-UTF-8 filename", path.display()));
            continue;
        };
        if exclude_pats.iter().any(|p| p.matches(file_name)) {
            tracing::trace!(file = file_name, "Excluded by pattern");
            continue;
        }
        if !include_pats.is_empty() && !include_pats.iter().any(|p| p.matches(file_name)) {
            tracing::trace!(file = file_name, "Not matched by include patterns");
            continue;
        }

        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                let msg = format!("Cannot read metadata for '{}': {e}", path.display());
                tracing::warn!(warning = %msg, "Discovery warning");
                warnings.push(msg);
                continue;
            }
        };

        if files.len() >= config.max_files {
            return Err(DiscoveryError::MaxFilesExceeded {
                max: config.max_files,
            });
        }
        files.push(DiscoveredEvidence {
            path: path.to_path_buf(),
            size,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::debug!(
        files = files.len(),
        warnings = warnings.len(),
        "Evidence discovery complete"
    );
    Ok((files, warnings))
}

// =============================================================================
// Glob helpers
// =============================================================================

/// Compile glob patterns, logging and skipping any that are invalid.
fn compile_patterns(patterns: &[String], kind: &str) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                tracing::warn!(pattern = p, kind, error = %e, "Invalid glob pattern, skipping");
                None
            }
        })
        .collect()
}

/// Literal exclude patterns (no wildcards) also name directories to prune.
fn is_excluded_component(dir_name: &str, exclude_pats: &[glob::Pattern]) -> bool {
    exclude_pats.iter().any(|p| {
        let s = p.as_str();
        !s.contains('*') && !s.contains('?') && !s.contains('[') && p.matches(dir_name)
    })
}
