//! Columnar Sink
//!
//! Persists the unified event stream to hourly-partitioned Parquet files
//! with atomic visibility: each file is written to a `.tmp` sibling, fsynced
//! and renamed, then recorded in the symbol manifest (itself atomically
//! rewritten). Consumers discover files only through the manifest; orphaned
//! `.tmp` files are ignored by construction.
//!
//! Write failures are retried with exponential backoff (3 attempts);
//! persistent failure surfaces as `SinkUnavailable` and drains the worker.

use crate::recon::clock::{HourBucket, Nanos};
use crate::recon::columnar::{
    decimal_array, decimal_type, fp_value, level_list_type, list_column, read_levels, u64_column,
};
use crate::recon::config::{Compression as SinkCompression, ReconConfig};
use crate::recon::error::ReconError;
use crate::recon::events::{EventKind, PriceLevel, UnifiedEvent};
use crate::recon::fixed::FixedPoint;
use crate::recon::manifest::{sha256_bytes, ManifestEntry, SinkManifest};
use arrow::array::{Array, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Bounded retry schedule for filesystem operations.
const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Commit acknowledgement handed to the checkpointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCommit {
    /// Manifest sequence of the last committed file.
    pub seq: u64,
    /// Rows committed by this batch across all partitions.
    pub rows: u64,
}

/// Schema of the unified output files.
pub fn unified_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("event_ts_ns", DataType::UInt64, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("tiebreak_seq", DataType::UInt64, false),
        Field::new("update_id", DataType::UInt64, true),
        Field::new("trade_id", DataType::UInt64, true),
        Field::new("price", decimal_type(), true),
        Field::new("quantity", decimal_type(), true),
        Field::new("side", DataType::Utf8, true),
        Field::new("bids", level_list_type(), true),
        Field::new("asks", level_list_type(), true),
        Field::new("drift_rms", DataType::Float64, true),
        Field::new("origin_ts_ns", DataType::UInt64, true),
    ]))
}

/// Micro-batched writer for one symbol's unified stream.
pub struct ColumnarSink {
    symbol: String,
    symbol_root: PathBuf,
    config: ReconConfig,
    manifest: SinkManifest,
    next_seq: u64,
}

impl ColumnarSink {
    /// Open (or resume) the sink for a symbol. An existing manifest
    /// continues its part numbering.
    pub fn open(output_root: &Path, symbol: &str, config: ReconConfig) -> Result<Self, ReconError> {
        let symbol_root = output_root.join(symbol);
        std::fs::create_dir_all(&symbol_root)?;
        let manifest = SinkManifest::load(&symbol_root, symbol)?;
        let next_seq = manifest.last_seq() + 1;
        if !manifest.entries.is_empty() {
            info!(
                symbol,
                committed = manifest.entries.len(),
                next_seq,
                "sink resumed from existing manifest"
            );
        }
        Ok(ColumnarSink {
            symbol: symbol.to_string(),
            symbol_root,
            config,
            manifest,
            next_seq,
        })
    }

    /// Sequence of the last committed file (the sink watermark).
    #[inline]
    pub fn committed_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Persist a batch, splitting it across UTC-hour partitions.
    pub fn write_batch(
        &mut self,
        events: &[UnifiedEvent],
    ) -> Result<Option<SinkCommit>, ReconError> {
        if events.is_empty() {
            return Ok(None);
        }

        let mut rows = 0u64;
        let mut start = 0usize;
        while start < events.len() {
            let bucket = HourBucket::from_nanos(events[start].event_ts_ns);
            let mut end = start + 1;
            while end < events.len() && HourBucket::from_nanos(events[end].event_ts_ns) == bucket {
                end += 1;
            }
            self.write_partition_file(&events[start..end], bucket)?;
            rows += (end - start) as u64;
            start = end;
        }

        Ok(Some(SinkCommit {
            seq: self.committed_seq(),
            rows,
        }))
    }

    /// Write one hour-partition file and record it in the manifest.
    fn write_partition_file(
        &mut self,
        events: &[UnifiedEvent],
        bucket: HourBucket,
    ) -> Result<(), ReconError> {
        let seq = self.next_seq;
        let partition = bucket.partition_path();
        let relative = format!("{}/part-{}.parquet", partition, seq);
        let dir = self.symbol_root.join(&partition);
        let final_path = dir.join(format!("part-{}.parquet", seq));
        let tmp_path = dir.join(format!("part-{}.parquet.tmp", seq));

        let bytes = encode_parquet(events, self.config.compression)?;
        let sha256 = sha256_bytes(&bytes);

        let min_update_id = events.iter().filter_map(|e| e.update_id).min();
        let max_update_id = events.iter().filter_map(|e| e.update_id).max();

        let entry = ManifestEntry {
            symbol: self.symbol.clone(),
            file: relative.clone(),
            seq,
            first_event_ts_ns: events.first().map(|e| e.event_ts_ns).unwrap_or(0),
            last_event_ts_ns: events.last().map(|e| e.event_ts_ns).unwrap_or(0),
            row_count: events.len() as u64,
            min_update_id,
            max_update_id,
            sha256,
            bytes: bytes.len() as u64,
            created_ts_ns: wall_clock_ns(),
        };

        let mut last_err: Option<ReconError> = None;
        for attempt in 0..WRITE_ATTEMPTS {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    file = %final_path.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "sink write retry"
                );
                std::thread::sleep(delay);
            }
            match self.try_commit_file(&dir, &tmp_path, &final_path, &bytes, entry.clone()) {
                Ok(()) => {
                    self.next_seq += 1;
                    debug!(
                        file = %relative,
                        rows = events.len(),
                        bytes = bytes.len(),
                        "partition file committed"
                    );
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(ReconError::SinkUnavailable {
            detail: format!(
                "{} after {} attempts: {}",
                final_path.display(),
                WRITE_ATTEMPTS,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    /// One attempt of the atomic write protocol: tmp write, fsync file and
    /// directory, rename, manifest append.
    fn try_commit_file(
        &mut self,
        dir: &Path,
        tmp_path: &Path,
        final_path: &Path,
        bytes: &[u8],
        entry: ManifestEntry,
    ) -> Result<(), ReconError> {
        std::fs::create_dir_all(dir)?;
        {
            let mut file = File::create(tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(tmp_path, final_path)?;
        File::open(dir)?.sync_all()?;
        self.manifest.commit(&self.symbol_root, entry)?;
        Ok(())
    }
}

/// Serialize events into compressed Parquet bytes.
fn encode_parquet(
    events: &[UnifiedEvent],
    compression: SinkCompression,
) -> Result<Vec<u8>, ReconError> {
    let batch = encode_batch(events)?;
    let codec = match compression {
        SinkCompression::Snappy => Compression::SNAPPY,
        SinkCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
    };
    let props = WriterProperties::builder().set_compression(codec).build();

    let mut bytes = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut bytes, unified_schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(bytes)
}

/// Build the Arrow batch for a slice of unified events.
fn encode_batch(events: &[UnifiedEvent]) -> Result<RecordBatch, ReconError> {
    let event_ts: Vec<u64> = events.iter().map(|e| e.event_ts_ns).collect();
    let event_type: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    let tiebreak: Vec<u64> = events.iter().map(|e| e.tiebreak_seq).collect();
    let update_id: Vec<Option<u64>> = events.iter().map(|e| e.update_id).collect();
    let trade_id: Vec<Option<u64>> = events.iter().map(|e| e.trade_id).collect();
    let price = decimal_array(
        events
            .iter()
            .map(|e| e.price.map(FixedPoint::to_decimal128_18)),
    )?;
    let quantity = decimal_array(
        events
            .iter()
            .map(|e| e.quantity.map(FixedPoint::to_decimal128_18)),
    )?;
    let side: Vec<Option<&str>> = events.iter().map(|e| e.side.map(|s| s.as_str())).collect();
    let bid_rows: Vec<Option<&[PriceLevel]>> =
        events.iter().map(|e| e.bids.as_deref()).collect();
    let ask_rows: Vec<Option<&[PriceLevel]>> =
        events.iter().map(|e| e.asks.as_deref()).collect();
    let drift: Vec<Option<f64>> = events.iter().map(|e| e.drift_rms).collect();
    let origin: Vec<Option<u64>> = events.iter().map(|e| e.origin_ts_ns).collect();

    Ok(RecordBatch::try_new(
        unified_schema(),
        vec![
            Arc::new(UInt64Array::from(event_ts)),
            Arc::new(StringArray::from(event_type)),
            Arc::new(UInt64Array::from(tiebreak)),
            Arc::new(UInt64Array::from(update_id)),
            Arc::new(UInt64Array::from(trade_id)),
            Arc::new(price),
            Arc::new(quantity),
            Arc::new(StringArray::from(side)),
            Arc::new(crate::recon::columnar::level_list_array(&bid_rows)),
            Arc::new(crate::recon::columnar::level_list_array(&ask_rows)),
            Arc::new(Float64Array::from(drift)),
            Arc::new(UInt64Array::from(origin)),
        ],
    )?)
}

/// Decode a committed unified file back into events (verification, tests,
/// downstream tooling).
pub fn read_unified_file(path: &Path) -> Result<Vec<UnifiedEvent>, ReconError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let name = path.to_string_lossy().into_owned();

    let mut events = Vec::new();
    for batch in reader {
        let batch = batch?;
        let event_ts = u64_column(&batch, "event_ts_ns", &name)?;
        let event_type = batch
            .column_by_name("event_type")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| ReconError::SchemaMismatch {
                file: name.clone(),
                detail: "column \"event_type\" is not utf8".into(),
            })?;
        let tiebreak = u64_column(&batch, "tiebreak_seq", &name)?;
        let update_id = u64_column(&batch, "update_id", &name)?;
        let trade_id = u64_column(&batch, "trade_id", &name)?;
        let price = crate::recon::columnar::decimal_column(&batch, "price", &name)?;
        let quantity = crate::recon::columnar::decimal_column(&batch, "quantity", &name)?;
        let side = batch
            .column_by_name("side")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| ReconError::SchemaMismatch {
                file: name.clone(),
                detail: "column \"side\" is not utf8".into(),
            })?;
        let bids = list_column(&batch, "bids", &name)?;
        let asks = list_column(&batch, "asks", &name)?;
        let drift = batch
            .column_by_name("drift_rms")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .ok_or_else(|| ReconError::SchemaMismatch {
                file: name.clone(),
                detail: "column \"drift_rms\" is not f64".into(),
            })?;
        let origin = u64_column(&batch, "origin_ts_ns", &name)?;

        for i in 0..batch.num_rows() {
            let kind = EventKind::parse(event_type.value(i)).ok_or_else(|| {
                ReconError::DecodeError {
                    file: name.clone(),
                    row: i as u64,
                    detail: format!("unknown event_type {:?}", event_type.value(i)),
                }
            })?;
            let side_value = if side.is_null(i) {
                None
            } else {
                crate::recon::events::Side::parse(side.value(i))
            };
            events.push(UnifiedEvent {
                event_ts_ns: event_ts.value(i) as Nanos,
                event_type: kind,
                tiebreak_seq: tiebreak.value(i),
                update_id: (!update_id.is_null(i)).then(|| update_id.value(i)),
                trade_id: (!trade_id.is_null(i)).then(|| trade_id.value(i)),
                price: if price.is_null(i) {
                    None
                } else {
                    Some(fp_value(price, i, "price", &name)?)
                },
                quantity: if quantity.is_null(i) {
                    None
                } else {
                    Some(fp_value(quantity, i, "quantity", &name)?)
                },
                side: side_value,
                bids: if bids.is_null(i) {
                    None
                } else {
                    Some(read_levels(bids, i, "bids", &name)?)
                },
                asks: if asks.is_null(i) {
                    None
                } else {
                    Some(read_levels(asks, i, "asks", &name)?)
                },
                drift_rms: (!drift.is_null(i)).then(|| drift.value(i)),
                origin_ts_ns: (!origin.is_null(i)).then(|| origin.value(i)),
            });
        }
    }
    Ok(events)
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
