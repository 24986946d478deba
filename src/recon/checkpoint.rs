//! Checkpointer
//!
//! Persists pipeline resume points as Parquet `.cpk` files: the book's
//! levels as columns, everything else (positions, counters, watermark) as
//! JSON in the Parquet footer metadata together with a format version.
//! Files are written temp + fsync + rename with permissions 0600 in a 0700
//! directory, and tracked in `checkpoints/<symbol>/manifest.json` whose
//! per-file sha256 is re-verified on load.
//!
//! Marks are captured by the replay engine at sink-commit boundaries, so a
//! persisted checkpoint always reflects a moment whose output batch is
//! already visible in the sink manifest (CK-style consistency). Capture is
//! a compact array clone; serialization happens here, off the hot path.

use crate::recon::book::BookLevels;
use crate::recon::columnar::{decimal_array, decimal_type};
use crate::recon::config::ReconConfig;
use crate::recon::error::ReconError;
use crate::recon::events::OrderKey;
use crate::recon::fixed::FixedPoint;
use crate::recon::manifest::sha256_bytes;
use crate::recon::replay::{ReplayCounters, ReplayMark, StreamPositions};
use arrow::array::StringArray;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
const META_KEY: &str = "reconstruct.checkpoint";
const MANIFEST_FILE: &str = "manifest.json";

/// Footer metadata of a checkpoint file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    format_version: u32,
    symbol: String,
    positions: StreamPositions,
    counters: ReplayCounters,
    watermark: Option<OrderKey>,
    last_event_ts_ns: u64,
    seam: bool,
    last_update_id: Option<u64>,
    bootstrapped: bool,
    sink_seq: u64,
}

/// One persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifestEntry {
    pub file: String,
    pub seq: u64,
    pub sha256: String,
    pub bytes: u64,
    pub events_processed: u64,
    pub created_ts_ns: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointManifest {
    symbol: String,
    entries: Vec<CheckpointManifestEntry>,
}

/// A restored resume point.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredCheckpoint {
    pub mark: ReplayMark,
    /// Sink watermark at checkpoint time (last committed manifest seq).
    pub sink_seq: u64,
    /// Manifest sequence of the checkpoint itself.
    pub checkpoint_seq: u64,
}

/// Writer side of checkpointing, owned by the worker's checkpoint task.
pub struct Checkpointer {
    dir: PathBuf,
    symbol: String,
    manifest: CheckpointManifest,
    next_seq: u64,
    checkpoint_events: u64,
    checkpoint_interval: Duration,
    events_at_last_write: u64,
    last_write: Instant,
}

impl Checkpointer {
    /// Open (or create) the checkpoint directory for a symbol.
    pub fn open(
        checkpoint_root: &Path,
        symbol: &str,
        config: &ReconConfig,
    ) -> Result<Self, ReconError> {
        let dir = checkpoint_root.join(symbol);
        std::fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;

        let manifest = load_manifest(&dir, symbol)?;
        let next_seq = manifest.entries.last().map(|e| e.seq).unwrap_or(0) + 1;
        let events_at_last_write = manifest
            .entries
            .last()
            .map(|e| e.events_processed)
            .unwrap_or(0);

        Ok(Checkpointer {
            dir,
            symbol: symbol.to_string(),
            manifest,
            next_seq,
            checkpoint_events: config.checkpoint_events,
            checkpoint_interval: Duration::from_millis(config.checkpoint_interval_ms),
            events_at_last_write,
            last_write: Instant::now(),
        })
    }

    /// Whether the event-count or wall-time trigger has fired.
    pub fn due(&self, events_processed: u64) -> bool {
        events_processed.saturating_sub(self.events_at_last_write) >= self.checkpoint_events
            || self.last_write.elapsed() >= self.checkpoint_interval
    }

    /// Persist a mark. Called on triggers, explicit requests, and at
    /// terminal drain.
    pub fn write(&mut self, mark: &ReplayMark, sink_seq: u64) -> Result<PathBuf, ReconError> {
        let seq = self.next_seq;
        let file_name = format!("ckpt-{}.cpk", seq);
        let final_path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!("{}.tmp", file_name));

        let meta = CheckpointMeta {
            format_version: CHECKPOINT_FORMAT_VERSION,
            symbol: self.symbol.clone(),
            positions: mark.positions.clone(),
            counters: mark.counters.clone(),
            watermark: mark.watermark,
            last_event_ts_ns: mark.last_event_ts_ns,
            seam: mark.seam,
            last_update_id: mark.book.last_update_id,
            bootstrapped: mark.book.bootstrapped,
            sink_seq,
        };
        let bytes = encode_checkpoint(&mark.book, &meta)?;
        let sha256 = sha256_bytes(&bytes);

        {
            let mut file = File::create(&tmp_path)?;
            restrict_file(&file)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        self.manifest.entries.push(CheckpointManifestEntry {
            file: file_name,
            seq,
            sha256,
            bytes: bytes.len() as u64,
            events_processed: mark.counters.events_processed,
            created_ts_ns: wall_clock_ns(),
        });
        if let Err(e) = save_manifest(&self.dir, &self.manifest) {
            self.manifest.entries.pop();
            return Err(e);
        }

        self.next_seq += 1;
        self.events_at_last_write = mark.counters.events_processed;
        self.last_write = Instant::now();
        info!(
            symbol = %self.symbol,
            seq,
            events_processed = mark.counters.events_processed,
            sink_seq,
            "checkpoint written"
        );
        Ok(final_path)
    }
}

/// Sequence of the newest recorded checkpoint, if any. Used by the
/// supervisor to detect workers failing repeatedly at the same point.
pub fn latest_checkpoint_seq(checkpoint_root: &Path, symbol: &str) -> Option<u64> {
    let dir = checkpoint_root.join(symbol);
    load_manifest(&dir, symbol)
        .ok()
        .and_then(|m| m.entries.last().map(|e| e.seq))
}

/// Scan for the newest checkpoint that passes hash and format validation.
///
/// Returns `None` when no checkpoints exist. If checkpoints exist but none
/// verifies, that is corruption: resuming silently from nothing would
/// double-emit the whole history.
pub fn latest_checkpoint(
    checkpoint_root: &Path,
    symbol: &str,
) -> Result<Option<RestoredCheckpoint>, ReconError> {
    let dir = checkpoint_root.join(symbol);
    let manifest = load_manifest(&dir, symbol)?;
    if manifest.entries.is_empty() {
        return Ok(None);
    }

    for entry in manifest.entries.iter().rev() {
        let path = dir.join(&entry.file);
        match load_checkpoint(&path, entry) {
            Ok(restored) => return Ok(Some(restored)),
            Err(e) => {
                warn!(
                    file = %path.display(),
                    error = %e,
                    "checkpoint failed validation; trying previous"
                );
            }
        }
    }

    Err(ReconError::CheckpointCorruption {
        path: dir.display().to_string(),
        detail: "no checkpoint passed integrity validation".to_string(),
    })
}

fn load_checkpoint(
    path: &Path,
    entry: &CheckpointManifestEntry,
) -> Result<RestoredCheckpoint, ReconError> {
    let bytes = std::fs::read(path)?;
    let actual = sha256_bytes(&bytes);
    if actual != entry.sha256 {
        return Err(ReconError::CheckpointCorruption {
            path: path.display().to_string(),
            detail: format!("sha256 mismatch: manifest {}, file {}", entry.sha256, actual),
        });
    }

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let meta_json = reader
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == META_KEY))
        .and_then(|kv| kv.value.clone())
        .ok_or_else(|| ReconError::CheckpointCorruption {
            path: path.display().to_string(),
            detail: "missing checkpoint metadata".to_string(),
        })?;
    let meta: CheckpointMeta =
        serde_json::from_str(&meta_json).map_err(|e| ReconError::CheckpointCorruption {
            path: path.display().to_string(),
            detail: format!("invalid checkpoint metadata: {}", e),
        })?;
    if meta.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(ReconError::CheckpointCorruption {
            path: path.display().to_string(),
            detail: format!("unsupported format version {}", meta.format_version),
        });
    }

    let mut book = BookLevels {
        bids: Vec::new(),
        asks: Vec::new(),
        last_update_id: meta.last_update_id,
        bootstrapped: meta.bootstrapped,
    };
    for batch in reader.build()? {
        let batch = batch?;
        decode_levels(&batch, path, &mut book)?;
    }

    Ok(RestoredCheckpoint {
        mark: ReplayMark {
            book,
            positions: meta.positions,
            counters: meta.counters,
            watermark: meta.watermark,
            last_event_ts_ns: meta.last_event_ts_ns,
            seam: meta.seam,
        },
        sink_seq: meta.sink_seq,
        checkpoint_seq: entry.seq,
    })
}

fn checkpoint_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("side", DataType::Utf8, false),
        Field::new("price", decimal_type(), false),
        Field::new("qty", decimal_type(), false),
    ]))
}

fn encode_checkpoint(book: &BookLevels, meta: &CheckpointMeta) -> Result<Vec<u8>, ReconError> {
    let mut sides: Vec<&str> = Vec::with_capacity(book.bids.len() + book.asks.len());
    let mut prices: Vec<Option<i128>> = Vec::with_capacity(sides.capacity());
    let mut qtys: Vec<Option<i128>> = Vec::with_capacity(sides.capacity());
    for &(price, qty) in &book.bids {
        sides.push("bid");
        prices.push(Some(FixedPoint::from_raw(price).to_decimal128_18()));
        qtys.push(Some(FixedPoint::from_raw(qty).to_decimal128_18()));
    }
    for &(price, qty) in &book.asks {
        sides.push("ask");
        prices.push(Some(FixedPoint::from_raw(price).to_decimal128_18()));
        qtys.push(Some(FixedPoint::from_raw(qty).to_decimal128_18()));
    }

    let batch = RecordBatch::try_new(
        checkpoint_schema(),
        vec![
            Arc::new(StringArray::from(sides)),
            Arc::new(decimal_array(prices)?),
            Arc::new(decimal_array(qtys)?),
        ],
    )?;

    let meta_json = serde_json::to_string(meta).map_err(|e| ReconError::CheckpointCorruption {
        path: meta.symbol.clone(),
        detail: format!("metadata serialization: {}", e),
    })?;
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![KeyValue::new(META_KEY.to_string(), meta_json)]))
        .build();

    let mut bytes = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut bytes, checkpoint_schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(bytes)
}

fn decode_levels(
    batch: &RecordBatch,
    path: &Path,
    book: &mut BookLevels,
) -> Result<(), ReconError> {
    let name = path.to_string_lossy().into_owned();
    let side = batch
        .column_by_name("side")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ReconError::CheckpointCorruption {
            path: name.clone(),
            detail: "side column missing".to_string(),
        })?;
    let price = crate::recon::columnar::decimal_column(batch, "price", &name)?;
    let qty = crate::recon::columnar::decimal_column(batch, "qty", &name)?;

    for i in 0..batch.num_rows() {
        let p = FixedPoint::from_decimal128_18(price.value(i))?.raw();
        let q = FixedPoint::from_decimal128_18(qty.value(i))?.raw();
        match side.value(i) {
            "bid" => book.bids.push((p, q)),
            "ask" => book.asks.push((p, q)),
            other => {
                return Err(ReconError::CheckpointCorruption {
                    path: name,
                    detail: format!("unknown side {:?}", other),
                })
            }
        }
    }
    Ok(())
}

fn load_manifest(dir: &Path, symbol: &str) -> Result<CheckpointManifest, ReconError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(CheckpointManifest {
            symbol: symbol.to_string(),
            entries: Vec::new(),
        });
    }
    let text = std::fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(|e| ReconError::CheckpointCorruption {
        path: path.display().to_string(),
        detail: format!("corrupt checkpoint manifest: {}", e),
    })
}

fn save_manifest(dir: &Path, manifest: &CheckpointManifest) -> Result<(), ReconError> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
    let text =
        serde_json::to_string_pretty(manifest).map_err(|e| ReconError::CheckpointCorruption {
            path: path.display().to_string(),
            detail: format!("manifest serialization: {}", e),
        })?;
    {
        let mut file = File::create(&tmp)?;
        restrict_file(&file)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> Result<(), ReconError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> Result<(), ReconError> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file(file: &File) -> Result<(), ReconError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_file: &File) -> Result<(), ReconError> {
    Ok(())
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recon::reader::ReaderPosition;

    fn make_mark(events_processed: u64) -> ReplayMark {
        ReplayMark {
            book: BookLevels {
                bids: vec![(10_000_000_000, 100_000_000), (9_990_000_000, 50_000_000)],
                asks: vec![(10_010_000_000, 200_000_000)],
                last_update_id: Some(101),
                bootstrapped: true,
            },
            positions: StreamPositions {
                trades: ReaderPosition {
                    file: Some("trades-0001.parquet".into()),
                    rows_into_file: 10,
                    records_emitted: 10,
                },
                snapshots: ReaderPosition::default(),
                deltas: ReaderPosition {
                    file: Some("deltas-0001.parquet".into()),
                    rows_into_file: 5,
                    records_emitted: 5,
                },
            },
            counters: ReplayCounters {
                events_processed,
                deltas_applied: 5,
                ..Default::default()
            },
            watermark: Some(OrderKey {
                event_ts_ns: 1100,
                type_rank: 1,
                tiebreak_seq: 4,
            }),
            last_event_ts_ns: 1100,
            seam: false,
        }
    }

    #[test]
    fn test_write_and_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig::default();
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();

        let mark = make_mark(16);
        checkpointer.write(&mark, 3).unwrap();

        let restored = latest_checkpoint(tmp.path(), "btcusdt").unwrap().unwrap();
        assert_eq!(restored.mark, mark);
        assert_eq!(restored.sink_seq, 3);
        assert_eq!(restored.checkpoint_seq, 1);
    }

    #[test]
    fn test_latest_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig::default();
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();
        checkpointer.write(&make_mark(10), 1).unwrap();
        checkpointer.write(&make_mark(20), 2).unwrap();

        let restored = latest_checkpoint(tmp.path(), "btcusdt").unwrap().unwrap();
        assert_eq!(restored.mark.counters.events_processed, 20);
        assert_eq!(restored.checkpoint_seq, 2);
    }

    #[test]
    fn test_corruption_falls_back_to_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig::default();
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();
        checkpointer.write(&make_mark(10), 1).unwrap();
        let newest = checkpointer.write(&make_mark(20), 2).unwrap();

        // Flip a byte in the newest checkpoint.
        let mut bytes = std::fs::read(&newest).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&newest, bytes).unwrap();

        let restored = latest_checkpoint(tmp.path(), "btcusdt").unwrap().unwrap();
        assert_eq!(restored.mark.counters.events_processed, 10);
    }

    #[test]
    fn test_all_corrupt_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig::default();
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();
        let path = checkpointer.write(&make_mark(10), 1).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        assert!(matches!(
            latest_checkpoint(tmp.path(), "btcusdt"),
            Err(ReconError::CheckpointCorruption { .. })
        ));
    }

    #[test]
    fn test_no_checkpoints_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(tmp.path(), "btcusdt").unwrap().is_none());
    }

    #[test]
    fn test_event_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig {
            checkpoint_events: 100,
            checkpoint_interval_ms: 3_600_000,
            ..Default::default()
        };
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();
        assert!(!checkpointer.due(99));
        assert!(checkpointer.due(100));
        checkpointer.write(&make_mark(100), 1).unwrap();
        assert!(!checkpointer.due(150));
        assert!(checkpointer.due(200));
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let config = ReconConfig::default();
        let mut checkpointer = Checkpointer::open(tmp.path(), "btcusdt", &config).unwrap();
        let path = checkpointer.write(&make_mark(10), 1).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(tmp.path().join("btcusdt"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
