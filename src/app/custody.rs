// Casetrail - app/custody.rs
//
// The Integrity Ledger: the manifest bound to its JSON Lines file on disk.
//
// This is the only code that appends HashRecords. Digests may be computed
// in parallel on a bounded worker pool, but appends happen one at a time,
// in path order, on the calling thread. The manifest file is opened in
// append mode for every record and is never rewritten or truncated.

use crate::core::manifest::{digest_reader, Appended, HashRecord, IntegrityViolation, Manifest, Stage};
use crate::util::constants;
use crate::util::error::{CasetrailError, LedgerError};
use chrono::{DateTime, SubsecRound, Utc};
use rayon::prelude::*;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Chain-of-custody ledger backed by a manifest file.
#[derive(Debug)]
pub struct IntegrityLedger {
    manifest_path: PathBuf,
    manifest: Manifest,
    mmap_threshold: u64,
}

impl IntegrityLedger {
    /// Open the ledger at `manifest_path`. A missing file is an empty
    /// manifest; it is created on the first append.
    pub fn open(manifest_path: &Path, mmap_threshold: u64) -> Result<Self, LedgerError> {
        let manifest = if manifest_path.exists() {
            load_manifest(manifest_path)?
        } else {
            Manifest::new()
        };
        tracing::info!(
            manifest = %manifest_path.display(),
            records = manifest.len(),
            "Integrity ledger opened"
        );
        Ok(Self {
            manifest_path: manifest_path.to_path_buf(),
            manifest,
            mmap_threshold,
        })
    }

    /// Read-only view for rules and reporting.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Hash `path` and append a record for `stage`.
    ///
    /// Returns the new record, or the identical record already present.
    pub fn record(&mut self, path: &Path, stage: Stage) -> Result<HashRecord, CasetrailError> {
        let digest = self.digest(path, stage)?;
        self.append(path, &digest, stage)
    }

    /// Recompute the digest of `path` and compare it with its baseline.
    /// Never writes to the manifest.
    pub fn verify(&self, path: &Path, stage: Stage) -> Result<HashRecord, IntegrityViolation> {
        let digest = self.digest(path, stage)?;
        self.check_digest(path, &digest, stage)
    }

    /// Verify `path`, then record that it was intact at `stage`.
    pub fn attest(&mut self, path: &Path, stage: Stage) -> Result<HashRecord, CasetrailError> {
        let digest = self.digest(path, stage)?;
        self.check_digest(path, &digest, stage)?;
        self.append(path, &digest, stage)
    }

    /// Record every path. Digests are computed on `pool`; records are
    /// appended in path order. Stops at the first failure.
    pub fn record_all(
        &mut self,
        paths: &[PathBuf],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<HashRecord>, CasetrailError> {
        let digests = self.digest_all(paths, stage, pool)?;
        digests
            .iter()
            .map(|(path, digest)| self.append(path, digest, stage))
            .collect()
    }

    /// Verify every path on `pool`. Reports the violation for the first
    /// failing path in path order.
    pub fn verify_all(
        &self,
        paths: &[PathBuf],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<HashRecord>, IntegrityViolation> {
        let digests = self.digest_all(paths, stage, pool)?;
        digests
            .iter()
            .map(|(path, digest)| self.check_digest(path, digest, stage))
            .collect()
    }

    /// Verify every path, then record each one at `stage`. Nothing is
    /// appended unless every path verifies.
    pub fn attest_all(
        &mut self,
        paths: &[PathBuf],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<HashRecord>, CasetrailError> {
        let digests = self.digest_all(paths, stage, pool)?;
        for (path, digest) in &digests {
            self.check_digest(path, digest, stage)?;
        }
        digests
            .iter()
            .map(|(path, digest)| self.append(path, digest, stage))
            .collect()
    }

    /// Record files written under a staging name against the path they will
    /// be moved to. `pairs` are `(staged, target)`; each staged file is
    /// hashed and the digest is appended under the target's key, in target
    /// order. Nothing is appended unless every target can take its digest.
    pub fn record_staged(
        &mut self,
        pairs: &[(PathBuf, PathBuf)],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<HashRecord>, CasetrailError> {
        let digests = self.digest_pairs(pairs, stage, pool)?;
        for (target, digest) in &digests {
            if self.manifest.baseline(&ledger_key(target)).is_some() {
                self.check_digest(target, digest, stage)?;
            }
        }
        digests
            .iter()
            .map(|(target, digest)| self.append(target, digest, stage))
            .collect()
    }

    /// Re-hash staged files and compare them with their targets' baselines.
    pub fn verify_staged(
        &self,
        pairs: &[(PathBuf, PathBuf)],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<HashRecord>, IntegrityViolation> {
        let digests = self.digest_pairs(pairs, stage, pool)?;
        digests
            .iter()
            .map(|(target, digest)| self.check_digest(target, digest, stage))
            .collect()
    }

    /// Compare a digest computed elsewhere, such as over bytes already read
    /// into memory, with the baseline of `path`. Never writes.
    pub fn check_digest(
        &self,
        path: &Path,
        digest: &str,
        stage: Stage,
    ) -> Result<HashRecord, IntegrityViolation> {
        match self.manifest.check(&ledger_key(path), digest, stage) {
            Ok(baseline) => {
                tracing::debug!(file = %path.display(), %stage, "Digest matches baseline");
                Ok(baseline.clone())
            }
            Err(violation) => {
                tracing::error!(violation = %violation, "Integrity violation");
                Err(violation)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn append(&mut self, path: &Path, digest: &str, stage: Stage) -> Result<HashRecord, CasetrailError> {
        let manifest_path = self.manifest_path.clone();
        let appended = self
            .manifest
            .append_with(&ledger_key(path), digest, stage, now(), |record| {
                persist(&manifest_path, record).map_err(CasetrailError::from)
            })
            .map_err(|e| {
                if let CasetrailError::Integrity(ref v) = e {
                    tracing::error!(violation = %v, "Integrity violation");
                }
                e
            })?;

        match &appended {
            Appended::New(r) => {
                tracing::info!(file = %r.file_path, %stage, digest = %r.sha256_digest, "Hash recorded");
            }
            Appended::Existing(r) => {
                tracing::debug!(file = %r.file_path, %stage, "Identical record already present");
            }
        }
        Ok(appended.record().clone())
    }

    fn digest(&self, path: &Path, stage: Stage) -> Result<String, IntegrityViolation> {
        hash_file(path, self.mmap_threshold).map_err(|e| IntegrityViolation::Unreadable {
            file_path: ledger_key(path),
            stage,
            reason: e.to_string(),
        })
    }

    /// Digests for `paths` sorted by path; the first unreadable path in
    /// that order is reported.
    fn digest_all(
        &self,
        paths: &[PathBuf],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<(PathBuf, String)>, IntegrityViolation> {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        tracing::debug!(files = sorted.len(), %stage, threads = pool.current_num_threads(), "Hashing files");
        let results: Vec<Result<(PathBuf, String), IntegrityViolation>> = pool.install(|| {
            sorted
                .par_iter()
                .map(|path| Ok(((*path).clone(), self.digest(path, stage)?)))
                .collect()
        });
        results.into_iter().collect()
    }

    /// Digests of the staged half of each pair, keyed by the target and
    /// sorted by target.
    fn digest_pairs(
        &self,
        pairs: &[(PathBuf, PathBuf)],
        stage: Stage,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<(PathBuf, String)>, IntegrityViolation> {
        let mut sorted: Vec<&(PathBuf, PathBuf)> = pairs.iter().collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1));

        let results: Vec<Result<(PathBuf, String), IntegrityViolation>> = pool.install(|| {
            sorted
                .par_iter()
                .map(|(staged, target)| Ok((target.clone(), self.digest(staged, stage)?)))
                .collect()
        });
        results.into_iter().collect()
    }
}

/// The string a path is recorded under. Matches the `origin_file_ref` the
/// event store gives events read from the same path.
pub fn ledger_key(path: &Path) -> String {
    path.display().to_string()
}

/// Records are stamped to the second, like every other timestamp here.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

// =============================================================================
// Manifest file
// =============================================================================

fn load_manifest(path: &Path) -> Result<Manifest, LedgerError> {
    let io_err = |e: io::Error| LedgerError::ManifestIo {
        path: path.to_path_buf(),
        source: e,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: HashRecord =
            serde_json::from_str(&line).map_err(|e| LedgerError::ManifestParse {
                path: path.to_path_buf(),
                line_number: index + 1,
                source: e,
            })?;
        records.push(record);
    }
    Ok(Manifest::from_records(records))
}

fn persist(path: &Path, record: &HashRecord) -> Result<(), LedgerError> {
    let mut line = serde_json::to_string(record).map_err(|e| LedgerError::Serialize { source: e })?;
    line.push('\n');

    let io_err = |e: io::Error| LedgerError::ManifestIo {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(line.as_bytes()).map_err(io_err)?;
    file.sync_data().map_err(io_err)
}

// =============================================================================
// Hashing
// =============================================================================

/// SHA-256 of a file. Files at or above `mmap_threshold` bytes are hashed
/// through a read-only memory map; smaller ones are streamed, retrying
/// transient I/O errors.
pub fn hash_file(path: &Path, mmap_threshold: u64) -> io::Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size > 0 && size >= mmap_threshold {
        hash_large_file(path)
    } else {
        hash_small_file_with_retry(path)
    }
}

fn hash_large_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before returning. A
    // concurrent writer could change the bytes under the map; that shows up
    // as a digest mismatch, which is exactly what the ledger reports.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    digest_reader(&mmap[..], constants::HASH_CHUNK_SIZE)
}

fn hash_small_file_with_retry(path: &Path) -> io::Result<String> {
    let mut last_err: Option<io::Error> = None;

    for attempt in 0..constants::HASH_MAX_RETRIES {
        let result = File::open(path)
            .and_then(|f| digest_reader(BufReader::new(f), constants::HASH_CHUNK_SIZE));
        match result {
            Ok(digest) => return Ok(digest),
            Err(e) if is_transient_error(&e) => {
                tracing::debug!(
                    file = %path.display(),
                    attempt = attempt + 1,
                    error = %e,
                    "Transient I/O error, retrying"
                );
                std::thread::sleep(Duration::from_millis(
                    constants::HASH_RETRY_DELAYS_MS[attempt as usize],
                ));
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::other("Unknown read error")))
}

fn is_transient_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}
