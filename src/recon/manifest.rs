//! Sink Manifest
//!
//! The manifest is the single consistent view of committed output files;
//! directory listings are never trusted. Updates are atomic via
//! write-temp + rename, and every entry carries a sha256 so `reconstruct
//! verify` can re-check committed files end to end.

use crate::recon::error::ReconError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One committed output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub symbol: String,
    /// Path relative to the symbol root.
    pub file: String,
    /// Monotonic commit sequence; doubles as the sink watermark.
    pub seq: u64,
    pub first_event_ts_ns: u64,
    pub last_event_ts_ns: u64,
    pub row_count: u64,
    pub min_update_id: Option<u64>,
    pub max_update_id: Option<u64>,
    pub sha256: String,
    pub bytes: u64,
    /// Wall-clock commit time; excluded from determinism guarantees.
    pub created_ts_ns: u64,
}

/// Per-symbol manifest of committed files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkManifest {
    pub symbol: String,
    pub entries: Vec<ManifestEntry>,
}

impl SinkManifest {
    pub fn new(symbol: &str) -> Self {
        SinkManifest {
            symbol: symbol.to_string(),
            entries: Vec::new(),
        }
    }

    /// Load the manifest under `symbol_root`, or an empty one if absent.
    pub fn load(symbol_root: &Path, symbol: &str) -> Result<Self, ReconError> {
        let path = symbol_root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(SinkManifest::new(symbol));
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest: SinkManifest = serde_json::from_str(&text).map_err(|e| {
            ReconError::SinkUnavailable {
                detail: format!("corrupt manifest {}: {}", path.display(), e),
            }
        })?;
        Ok(manifest)
    }

    /// Highest committed sequence, or 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq).unwrap_or(0)
    }

    /// Append an entry and persist atomically. A failed save leaves the
    /// in-memory manifest unchanged so the caller can retry cleanly.
    pub fn commit(&mut self, symbol_root: &Path, entry: ManifestEntry) -> Result<(), ReconError> {
        self.entries.push(entry);
        if let Err(e) = self.save(symbol_root) {
            self.entries.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Atomic write-temp + rename, with directory fsync.
    pub fn save(&self, symbol_root: &Path) -> Result<(), ReconError> {
        std::fs::create_dir_all(symbol_root)?;
        let path = symbol_root.join(MANIFEST_FILE);
        let tmp = symbol_root.join(format!("{}.tmp", MANIFEST_FILE));
        let text = serde_json::to_string_pretty(self).map_err(|e| ReconError::SinkUnavailable {
            detail: format!("manifest serialization: {}", e),
        })?;
        std::fs::write(&tmp, text)?;
        File::open(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        File::open(symbol_root)?.sync_all()?;
        debug!(path = %path.display(), entries = self.entries.len(), "manifest committed");
        Ok(())
    }
}

/// Hash a file's contents.
pub fn sha256_file(path: &Path) -> Result<(String, u64), ReconError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Hash in-memory bytes.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A mismatch found while verifying a manifest.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyFailure {
    pub file: String,
    pub detail: String,
}

/// Outcome of `reconstruct verify`.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Re-hash and re-scan every file a manifest lists.
///
/// `manifest_path` is the manifest.json itself; files are resolved relative
/// to its directory.
pub fn verify_manifest(manifest_path: &Path) -> Result<VerifyReport, ReconError> {
    let text = std::fs::read_to_string(manifest_path)?;
    let manifest: SinkManifest =
        serde_json::from_str(&text).map_err(|e| ReconError::SinkUnavailable {
            detail: format!("corrupt manifest {}: {}", manifest_path.display(), e),
        })?;
    let root = manifest_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut failures = Vec::new();
    for entry in &manifest.entries {
        let path = root.join(&entry.file);
        match sha256_file(&path) {
            Err(e) => failures.push(VerifyFailure {
                file: entry.file.clone(),
                detail: format!("unreadable: {}", e),
            }),
            Ok((hash, bytes)) => {
                if hash != entry.sha256 {
                    failures.push(VerifyFailure {
                        file: entry.file.clone(),
                        detail: format!("sha256 mismatch: manifest {}, file {}", entry.sha256, hash),
                    });
                    continue;
                }
                if bytes != entry.bytes {
                    failures.push(VerifyFailure {
                        file: entry.file.clone(),
                        detail: format!("size mismatch: manifest {}, file {}", entry.bytes, bytes),
                    });
                    continue;
                }
                match crate::recon::sink::read_unified_file(&path) {
                    Err(e) => failures.push(VerifyFailure {
                        file: entry.file.clone(),
                        detail: format!("unreadable rows: {}", e),
                    }),
                    Ok(events) => {
                        let row_count = events.len() as u64;
                        let first = events.first().map(|e| e.event_ts_ns).unwrap_or(0);
                        let last = events.last().map(|e| e.event_ts_ns).unwrap_or(0);
                        if row_count != entry.row_count {
                            failures.push(VerifyFailure {
                                file: entry.file.clone(),
                                detail: format!(
                                    "row count mismatch: manifest {}, file {}",
                                    entry.row_count, row_count
                                ),
                            });
                        } else if first != entry.first_event_ts_ns || last != entry.last_event_ts_ns
                        {
                            failures.push(VerifyFailure {
                                file: entry.file.clone(),
                                detail: format!(
                                    "time range mismatch: manifest [{}, {}], file [{}, {}]",
                                    entry.first_event_ts_ns, entry.last_event_ts_ns, first, last
                                ),
                            });
                        }
                    }
                }
            }
        }
    }

    Ok(VerifyReport {
        files_checked: manifest.entries.len(),
        failures,
    })
}
