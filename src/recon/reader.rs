//! Input Readers
//!
//! Restartable, forward-only, chunked readers over the three columnar input
//! streams (`trades`, `book_snapshots`, `book_deltas`). Files are discovered
//! in lexicographic order under `<input_root>/<symbol>/<stream>/` and must be
//! non-decreasing in `exchange_ts_ns` within and across files; a violation is
//! fatal. Each reader assigns a cumulative per-stream record index used as
//! the merge tie-break sequence.

use crate::recon::clock::Nanos;
use crate::recon::columnar::{
    decimal_column, decimal_type, fp_value, level_list_type, list_column, read_levels, u64_column,
    u64_value,
};
use crate::recon::error::ReconError;
use crate::recon::events::{DeltaRecord, MarketEvent, SnapshotRecord, Side, TradeRecord};
use arrow::array::{Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default rows decoded per chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 1_000;

/// The three logical input streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Trades,
    Snapshots,
    Deltas,
}

impl StreamKind {
    /// Directory name under the per-symbol input root.
    pub fn dir_name(self) -> &'static str {
        match self {
            StreamKind::Trades => "trades",
            StreamKind::Snapshots => "book_snapshots",
            StreamKind::Deltas => "book_deltas",
        }
    }
}

/// Minimum schema of the `trades` stream.
pub fn trades_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("origin_ts_ns", DataType::UInt64, false),
        Field::new("exchange_ts_ns", DataType::UInt64, false),
        Field::new("trade_id", DataType::UInt64, false),
        Field::new("price", decimal_type(), false),
        Field::new("quantity", decimal_type(), false),
        Field::new("side", DataType::Utf8, false),
    ]))
}

/// Minimum schema of the `book_snapshots` stream.
pub fn snapshots_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("exchange_ts_ns", DataType::UInt64, false),
        Field::new("last_update_id", DataType::UInt64, false),
        Field::new("bids", level_list_type(), false),
        Field::new("asks", level_list_type(), false),
    ]))
}

/// Minimum schema of the `book_deltas` stream.
pub fn deltas_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("exchange_ts_ns", DataType::UInt64, false),
        Field::new("first_update_id", DataType::UInt64, false),
        Field::new("final_update_id", DataType::UInt64, false),
        Field::new("bids", level_list_type(), false),
        Field::new("asks", level_list_type(), false),
    ]))
}

/// Restartable reader position.
///
/// Columnar files are not byte-addressable mid-stream, so the offset is the
/// number of rows already consumed from `file`. `records_emitted` is the
/// cumulative per-stream record index (the merge tie-break sequence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReaderPosition {
    pub file: Option<String>,
    pub rows_into_file: u64,
    pub records_emitted: u64,
}

/// Chunked reader over one input stream.
pub struct StreamReader {
    kind: StreamKind,
    files: Vec<PathBuf>,
    /// Index of the next file to open.
    next_file: usize,
    current_file: Option<String>,
    reader: Option<ParquetRecordBatchReader>,
    buffer: VecDeque<MarketEvent>,
    rows_into_file: u64,
    records_emitted: u64,
    last_ts: Option<Nanos>,
    chunk_rows: usize,
}

impl StreamReader {
    /// Open a stream from the beginning.
    pub fn open(
        input_root: &Path,
        symbol: &str,
        kind: StreamKind,
        chunk_rows: usize,
    ) -> Result<Self, ReconError> {
        Self::open_at(input_root, symbol, kind, chunk_rows, None)
    }

    /// Open a stream, optionally resuming at a recorded position.
    pub fn open_at(
        input_root: &Path,
        symbol: &str,
        kind: StreamKind,
        chunk_rows: usize,
        position: Option<&ReaderPosition>,
    ) -> Result<Self, ReconError> {
        let dir = input_root.join(symbol).join(kind.dir_name());
        let files = discover_files(&dir)?;
        debug!(
            stream = kind.dir_name(),
            files = files.len(),
            "opened input stream"
        );

        let mut reader = StreamReader {
            kind,
            files,
            next_file: 0,
            current_file: None,
            reader: None,
            buffer: VecDeque::new(),
            rows_into_file: 0,
            records_emitted: 0,
            last_ts: None,
            chunk_rows: chunk_rows.max(1),
        };

        if let Some(pos) = position {
            reader.seek(pos)?;
        }
        Ok(reader)
    }

    /// Current position (points just past the last emitted record).
    pub fn position(&self) -> ReaderPosition {
        ReaderPosition {
            file: self.current_file.clone(),
            rows_into_file: self.rows_into_file,
            records_emitted: self.records_emitted,
        }
    }

    /// Next record with its tie-break sequence, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<(MarketEvent, u64)>, ReconError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                let ts = event.exchange_ts_ns();
                if let Some(prev) = self.last_ts {
                    if ts < prev {
                        return Err(ReconError::InputOutOfOrder {
                            file: self.current_file.clone().unwrap_or_default(),
                            row: self.rows_into_file,
                            prev_ts: prev,
                            ts,
                        });
                    }
                }
                self.last_ts = Some(ts);
                self.rows_into_file += 1;
                let seq = self.records_emitted;
                self.records_emitted += 1;
                return Ok(Some((event, seq)));
            }

            if !self.fill_buffer()? {
                return Ok(None);
            }
        }
    }

    /// Position the reader at a checkpointed location.
    fn seek(&mut self, position: &ReaderPosition) -> Result<(), ReconError> {
        let Some(ref file_name) = position.file else {
            // Nothing was consumed before the checkpoint.
            return Ok(());
        };
        let idx = self
            .files
            .iter()
            .position(|f| file_display(f) == *file_name)
            .ok_or_else(|| ReconError::CheckpointCorruption {
                path: file_name.clone(),
                detail: format!(
                    "{} stream no longer contains this file",
                    self.kind.dir_name()
                ),
            })?;
        self.open_file(idx, position.rows_into_file)?;
        self.rows_into_file = position.rows_into_file;
        self.records_emitted = position.records_emitted;
        Ok(())
    }

    /// Decode the next chunk into the buffer. Returns false at end of input.
    fn fill_buffer(&mut self) -> Result<bool, ReconError> {
        loop {
            if self.reader.is_none() {
                if self.next_file >= self.files.len() {
                    return Ok(false);
                }
                let idx = self.next_file;
                self.open_file(idx, 0)?;
                self.rows_into_file = 0;
            }

            let batch = match self.reader.as_mut().and_then(|r| r.next()) {
                Some(batch) => batch?,
                None => {
                    // Current file exhausted; keep its name for position
                    // reporting until the next file opens.
                    self.reader = None;
                    continue;
                }
            };

            if batch.num_rows() == 0 {
                continue;
            }
            let file = self.current_file.clone().unwrap_or_default();
            let row_base = self.rows_into_file + self.buffer.len() as u64;
            decode_batch(self.kind, &batch, &file, row_base, &mut self.buffer)?;
            return Ok(true);
        }
    }

    /// Open `files[idx]`, skipping `offset` rows. Transient I/O errors are
    /// retried once before becoming fatal.
    fn open_file(&mut self, idx: usize, offset: u64) -> Result<(), ReconError> {
        let path = self.files[idx].clone();
        let reader = match open_parquet(&path, self.chunk_rows, offset) {
            Ok(r) => r,
            Err(first) => {
                warn!(
                    file = %path.display(),
                    error = %first,
                    "input open failed, retrying once"
                );
                open_parquet(&path, self.chunk_rows, offset)?
            }
        };
        self.reader = Some(reader);
        self.current_file = Some(file_display(&path));
        self.next_file = idx + 1;
        Ok(())
    }
}

/// Lexicographically ordered parquet files in a stream directory.
/// A missing directory is an empty stream.
fn discover_files(dir: &Path) -> Result<Vec<PathBuf>, ReconError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "parquet").unwrap_or(false))
        .collect();
    files.sort_by_key(|p| file_display(p));
    Ok(files)
}

fn file_display(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn open_parquet(
    path: &Path,
    chunk_rows: usize,
    offset: u64,
) -> Result<ParquetRecordBatchReader, ReconError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(chunk_rows)
        .with_offset(offset as usize);
    Ok(builder.build()?)
}

fn decode_batch(
    kind: StreamKind,
    batch: &RecordBatch,
    file: &str,
    row_base: u64,
    out: &mut VecDeque<MarketEvent>,
) -> Result<(), ReconError> {
    match kind {
        StreamKind::Trades => decode_trades(batch, file, row_base, out),
        StreamKind::Snapshots => decode_snapshots(batch, file, row_base, out),
        StreamKind::Deltas => decode_deltas(batch, file, row_base, out),
    }
}

/// Rewrite a decode error's batch-relative row to the file-relative one.
fn at_row(err: ReconError, abs_row: u64) -> ReconError {
    match err {
        ReconError::DecodeError { file, detail, .. } => ReconError::DecodeError {
            file,
            row: abs_row,
            detail,
        },
        other => other,
    }
}

fn decode_trades(
    batch: &RecordBatch,
    file: &str,
    row_base: u64,
    out: &mut VecDeque<MarketEvent>,
) -> Result<(), ReconError> {
    let origin = u64_column(batch, "origin_ts_ns", file)?;
    let exchange = u64_column(batch, "exchange_ts_ns", file)?;
    let trade_id = u64_column(batch, "trade_id", file)?;
    let price = decimal_column(batch, "price", file)?;
    let quantity = decimal_column(batch, "quantity", file)?;
    let side = batch
        .column_by_name("side")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ReconError::SchemaMismatch {
            file: file.to_string(),
            detail: "column \"side\" is not utf8".to_string(),
        })?;

    for i in 0..batch.num_rows() {
        let row = row_base + i as u64;
        if side.is_null(i) {
            return Err(ReconError::DecodeError {
                file: file.to_string(),
                row,
                detail: "null side".to_string(),
            });
        }
        let side_value =
            Side::parse(side.value(i)).ok_or_else(|| ReconError::DecodeError {
                file: file.to_string(),
                row,
                detail: format!("unknown side {:?}", side.value(i)),
            })?;
        out.push_back(MarketEvent::Trade(TradeRecord {
            exchange_ts_ns: u64_value(exchange, i, "exchange_ts_ns", file).map_err(|e| at_row(e, row))?,
            origin_ts_ns: u64_value(origin, i, "origin_ts_ns", file).map_err(|e| at_row(e, row))?,
            trade_id: u64_value(trade_id, i, "trade_id", file).map_err(|e| at_row(e, row))?,
            price: fp_value(price, i, "price", file).map_err(|e| at_row(e, row))?,
            quantity: fp_value(quantity, i, "quantity", file).map_err(|e| at_row(e, row))?,
            side: side_value,
        }));
    }
    Ok(())
}

fn decode_snapshots(
    batch: &RecordBatch,
    file: &str,
    row_base: u64,
    out: &mut VecDeque<MarketEvent>,
) -> Result<(), ReconError> {
    let exchange = u64_column(batch, "exchange_ts_ns", file)?;
    let last_update_id = u64_column(batch, "last_update_id", file)?;
    let bids = list_column(batch, "bids", file)?;
    let asks = list_column(batch, "asks", file)?;

    for i in 0..batch.num_rows() {
        let row = row_base + i as u64;
        out.push_back(MarketEvent::Snapshot(SnapshotRecord {
            exchange_ts_ns: u64_value(exchange, i, "exchange_ts_ns", file).map_err(|e| at_row(e, row))?,
            last_update_id: u64_value(last_update_id, i, "last_update_id", file)
                .map_err(|e| at_row(e, row))?,
            bids: read_levels(bids, i, "bids", file).map_err(|e| at_row(e, row))?,
            asks: read_levels(asks, i, "asks", file).map_err(|e| at_row(e, row))?,
        }));
    }
    Ok(())
}

fn decode_deltas(
    batch: &RecordBatch,
    file: &str,
    row_base: u64,
    out: &mut VecDeque<MarketEvent>,
) -> Result<(), ReconError> {
    let exchange = u64_column(batch, "exchange_ts_ns", file)?;
    let first_update_id = u64_column(batch, "first_update_id", file)?;
    let final_update_id = u64_column(batch, "final_update_id", file)?;
    let bids = list_column(batch, "bids", file)?;
    let asks = list_column(batch, "asks", file)?;

    for i in 0..batch.num_rows() {
        let row = row_base + i as u64;
        let first = u64_value(first_update_id, i, "first_update_id", file).map_err(|e| at_row(e, row))?;
        let last = u64_value(final_update_id, i, "final_update_id", file).map_err(|e| at_row(e, row))?;
        if first > last {
            return Err(ReconError::DecodeError {
                file: file.to_string(),
                row,
                detail: format!("first_update_id {} > final_update_id {}", first, last),
            });
        }
        out.push_back(MarketEvent::Delta(DeltaRecord {
            exchange_ts_ns: u64_value(exchange, i, "exchange_ts_ns", file).map_err(|e| at_row(e, row))?,
            first_update_id: first,
            final_update_id: last,
            bids: read_levels(bids, i, "bids", file).map_err(|e| at_row(e, row))?,
            asks: read_levels(asks, i, "asks", file).map_err(|e| at_row(e, row))?,
        }));
    }
    Ok(())
}
