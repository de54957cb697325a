// Casetrail - core/manifest.rs
//
// Chain-of-custody record semantics: pipeline stages, HashRecords, the
// append-only manifest, and the comparison rules that turn a freshly
// computed digest into either an attestation or an IntegrityViolation.
//
// Core layer: this module hashes byte streams it is handed and never opens
// files itself. The persisted, file-backed ledger lives in app::custody.

use crate::core::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

// =============================================================================
// Stage
// =============================================================================

/// Pipeline stage at which a digest was taken.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Ingest,
    PostExtraction,
    PostAnalysis,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::PostExtraction => "post-extraction",
            Stage::PostAnalysis => "post-analysis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Stage::Ingest),
            "post-extraction" => Ok(Stage::PostExtraction),
            "post-analysis" => Ok(Stage::PostAnalysis),
            other => Err(format!(
                "unknown stage '{other}' (expected ingest, post-extraction or post-analysis)"
            )),
        }
    }
}

// =============================================================================
// HashRecord
// =============================================================================

/// One line of the custody manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub file_path: String,
    pub sha256_digest: String,
    pub stage: Stage,
    #[serde(with = "timestamp::canonical")]
    pub computed_at: DateTime<Utc>,
}

// =============================================================================
// IntegrityViolation
// =============================================================================

/// Evidence could not be shown to be unaltered. Always fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityViolation {
    /// The digest differs from the baseline record.
    DigestMismatch {
        file_path: String,
        stage: Stage,
        expected: String,
        actual: String,
    },

    /// No baseline record exists to compare against.
    Unrecorded { file_path: String, stage: Stage },

    /// The file could not be read to recompute its digest.
    Unreadable {
        file_path: String,
        stage: Stage,
        reason: String,
    },
}

impl IntegrityViolation {
    pub fn file_path(&self) -> &str {
        match self {
            Self::DigestMismatch { file_path, .. }
            | Self::Unrecorded { file_path, .. }
            | Self::Unreadable { file_path, .. } => file_path,
        }
    }
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DigestMismatch {
                file_path,
                stage,
                expected,
                actual,
            } => write!(
                f,
                "'{file_path}' at {stage}: digest {actual} does not match baseline {expected}"
            ),
            Self::Unrecorded { file_path, stage } => write!(
                f,
                "'{file_path}' at {stage}: no baseline digest in the manifest"
            ),
            Self::Unreadable {
                file_path,
                stage,
                reason,
            } => write!(f, "'{file_path}' at {stage}: cannot be read ({reason})"),
        }
    }
}

impl std::error::Error for IntegrityViolation {}

// =============================================================================
// Digests
// =============================================================================

/// SHA-256 of a byte slice, lowercase hex.
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of everything `reader` yields, read in `chunk_size` pieces.
pub fn digest_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// =============================================================================
// Manifest
// =============================================================================

/// Outcome of appending a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// The record is new and was appended.
    New(HashRecord),
    /// An identical (path, stage, digest) record already exists; nothing
    /// was appended and the existing record is returned.
    Existing(HashRecord),
}

impl Appended {
    pub fn record(&self) -> &HashRecord {
        match self {
            Appended::New(r) | Appended::Existing(r) => r,
        }
    }
}

/// In-memory append-only list of HashRecords.
///
/// There is no method that removes or edits a record. The only writer is
/// whoever owns the Manifest (the Integrity Ledger); readers get `&Manifest`
/// or a clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    records: Vec<HashRecord>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from previously persisted records, in their original order.
    pub fn from_records(records: Vec<HashRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[HashRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The first `ingest` record for `file_path`.
    pub fn ingest_record(&self, file_path: &str) -> Option<&HashRecord> {
        self.records
            .iter()
            .find(|r| r.file_path == file_path && r.stage == Stage::Ingest)
    }

    /// The record later digests of `file_path` are compared against: the
    /// `ingest` record when there is one, otherwise the earliest record of
    /// any stage (derived artifacts are first seen after ingest).
    pub fn baseline(&self, file_path: &str) -> Option<&HashRecord> {
        self.ingest_record(file_path)
            .or_else(|| self.records.iter().find(|r| r.file_path == file_path))
    }

    /// True when `file_path` has an `ingest` record.
    pub fn is_attested_at_ingest(&self, file_path: &str) -> bool {
        self.ingest_record(file_path).is_some()
    }

    /// Compare a freshly computed digest with the baseline.
    pub fn check(
        &self,
        file_path: &str,
        digest: &str,
        stage: Stage,
    ) -> Result<&HashRecord, IntegrityViolation> {
        let baseline = self
            .baseline(file_path)
            .ok_or_else(|| IntegrityViolation::Unrecorded {
                file_path: file_path.to_string(),
                stage,
            })?;
        if baseline.sha256_digest != digest {
            return Err(IntegrityViolation::DigestMismatch {
                file_path: file_path.to_string(),
                stage,
                expected: baseline.sha256_digest.clone(),
                actual: digest.to_string(),
            });
        }
        Ok(baseline)
    }

    /// Append a record for `(file_path, digest, stage)`.
    ///
    /// A second `ingest` digest for a path that already has a different one
    /// is a violation, not a new baseline. For later stages the digest must
    /// match the baseline. Re-appending an identical record is a no-op.
    pub fn append(
        &mut self,
        file_path: &str,
        digest: &str,
        stage: Stage,
        computed_at: DateTime<Utc>,
    ) -> Result<Appended, IntegrityViolation> {
        self.append_with(file_path, digest, stage, computed_at, |_| Ok(()))
    }

    /// Like [`Manifest::append`], but hands a new record to `persist` before
    /// it becomes part of the manifest. If `persist` fails the manifest is
    /// left unchanged.
    pub fn append_with<E, F>(
        &mut self,
        file_path: &str,
        digest: &str,
        stage: Stage,
        computed_at: DateTime<Utc>,
        persist: F,
    ) -> Result<Appended, E>
    where
        E: From<IntegrityViolation>,
        F: FnOnce(&HashRecord) -> Result<(), E>,
    {
        if let Some(existing) = self
            .records
            .iter()
            .find(|r| r.file_path == file_path && r.stage == stage && r.sha256_digest == digest)
        {
            return Ok(Appended::Existing(existing.clone()));
        }

        if self.baseline(file_path).is_some() {
            self.check(file_path, digest, stage)?;
        }

        let record = HashRecord {
            file_path: file_path.to_string(),
            sha256_digest: digest.to_string(),
            stage,
            computed_at,
        };
        persist(&record)?;
        self.records.push(record.clone());
        Ok(Appended::New(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timestamp::parse_canonical;
    use crate::util::error::CasetrailError;

    fn now() -> DateTime<Utc> {
        parse_canonical("2024-01-01 12:00:00").unwrap()
    }

    #[test]
    fn test_digest_reader_matches_digest_bytes() {
        let data = b"the quick brown fox".repeat(1_000);
        let streamed = digest_reader(&data[..], 7).unwrap();
        assert_eq!(streamed, digest_bytes(&data));
        assert_eq!(
            digest_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_check_against_ingest_baseline() {
        let mut m = Manifest::new();
        m.append("a.bin", "aa", Stage::Ingest, now()).unwrap();
        assert!(m.check("a.bin", "aa", Stage::PostExtraction).is_ok());
        let err = m.check("a.bin", "bb", Stage::PostExtraction).unwrap_err();
        assert!(matches!(err, IntegrityViolation::DigestMismatch { .. }));
        let err = m.check("other.bin", "aa", Stage::PostAnalysis).unwrap_err();
        assert!(matches!(err, IntegrityViolation::Unrecorded { .. }));
    }

    #[test]
    fn test_append_is_idempotent_for_identical_records() {
        let mut m = Manifest::new();
        assert!(matches!(
            m.append("a.bin", "aa", Stage::Ingest, now()).unwrap(),
            Appended::New(_)
        ));
        assert!(matches!(
            m.append("a.bin", "aa", Stage::Ingest, now()).unwrap(),
            Appended::Existing(_)
        ));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_second_ingest_digest_is_a_violation() {
        let mut m = Manifest::new();
        m.append("a.bin", "aa", Stage::Ingest, now()).unwrap();
        let err = m.append("a.bin", "bb", Stage::Ingest, now()).unwrap_err();
        assert!(matches!(err, IntegrityViolation::DigestMismatch { .. }));
        assert_eq!(m.len(), 1, "a rejected record must not be appended");
    }

    #[test]
    fn test_derived_artifact_baseline_is_first_record() {
        let mut m = Manifest::new();
        m.append("findings.json", "ff", Stage::PostAnalysis, now()).unwrap();
        assert_eq!(m.baseline("findings.json").unwrap().stage, Stage::PostAnalysis);
        assert!(!m.is_attested_at_ingest("findings.json"));
        assert!(m.check("findings.json", "ff", Stage::PostAnalysis).is_ok());
    }

    #[test]
    fn test_failed_persist_leaves_manifest_unchanged() {
        let mut m = Manifest::new();
        let result = m.append_with("a.bin", "aa", Stage::Ingest, now(), |_| {
            Err(CasetrailError::Io {
                path: "manifest.jsonl".into(),
                operation: "append",
                source: io::Error::other("disk full"),
            })
        });
        assert!(matches!(result, Err(CasetrailError::Io { .. })));
        assert!(m.is_empty());
    }

    #[test]
    fn test_stage_wire_names() {
        assert_eq!(serde_json::to_string(&Stage::PostExtraction).unwrap(), "\"post-extraction\"");
        assert_eq!("post-analysis".parse::<Stage>(), Ok(Stage::PostAnalysis));
        assert!("final".parse::<Stage>().is_err());
    }
}
