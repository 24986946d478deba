//! End-to-end pipeline tests: recorded inputs in, unified stream out.
//!
//! Inputs are generated as Parquet files with the same schemas the readers
//! consume, then a full worker pipeline runs against them and the committed
//! output is decoded and checked for ordering, content, determinism, and
//! resume behavior.

use arrow::array::{StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use reconstruct::recon::checkpoint::latest_checkpoint;
use reconstruct::recon::clock::NANOS_PER_HOUR;
use reconstruct::recon::columnar::{decimal_array, level_list_array};
use reconstruct::recon::config::ReconConfig;
use reconstruct::recon::events::{EventKind, PriceLevel, UnifiedEvent};
use reconstruct::recon::fixed::FixedPoint;
use reconstruct::recon::manifest::{verify_manifest, SinkManifest, MANIFEST_FILE};
use reconstruct::recon::reader::{deltas_schema, snapshots_schema, trades_schema};
use reconstruct::recon::sink::read_unified_file;
use reconstruct::recon::worker::{run_worker, ShutdownFlag, WorkerOptions, WorkerStats};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// 800 seconds into a UTC hour, so +1h in test data crosses a partition
// boundary.
const BASE: u64 = 1_700_000_000_000_000_000;

fn fp(raw: i64) -> FixedPoint {
    FixedPoint::from_raw(raw)
}

fn levels(raw: &[(i64, i64)]) -> Vec<PriceLevel> {
    raw.iter().map(|&(p, q)| (fp(p), fp(q))).collect()
}

struct TradeRow {
    exchange_ts_ns: u64,
    trade_id: u64,
    price: i64,
    quantity: i64,
    side: &'static str,
}

struct SnapshotRow {
    exchange_ts_ns: u64,
    last_update_id: u64,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

struct DeltaRow {
    exchange_ts_ns: u64,
    first_update_id: u64,
    final_update_id: u64,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

fn write_trades_file(path: &Path, rows: &[TradeRow]) {
    let schema = trades_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.exchange_ts_ns - 50).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.exchange_ts_ns).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.trade_id).collect::<Vec<_>>(),
            )),
            Arc::new(
                decimal_array(rows.iter().map(|r| Some(fp(r.price).to_decimal128_18()))).unwrap(),
            ),
            Arc::new(
                decimal_array(rows.iter().map(|r| Some(fp(r.quantity).to_decimal128_18())))
                    .unwrap(),
            ),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.side).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap();
    write_parquet(path, schema, batch);
}

fn write_snapshots_file(path: &Path, rows: &[SnapshotRow]) {
    let schema = snapshots_schema();
    let bid_rows: Vec<Option<&[PriceLevel]>> = rows.iter().map(|r| Some(r.bids.as_slice())).collect();
    let ask_rows: Vec<Option<&[PriceLevel]>> = rows.iter().map(|r| Some(r.asks.as_slice())).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.exchange_ts_ns).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.last_update_id).collect::<Vec<_>>(),
            )),
            Arc::new(level_list_array(&bid_rows)),
            Arc::new(level_list_array(&ask_rows)),
        ],
    )
    .unwrap();
    write_parquet(path, schema, batch);
}

fn write_deltas_file(path: &Path, rows: &[DeltaRow]) {
    let schema = deltas_schema();
    let bid_rows: Vec<Option<&[PriceLevel]>> = rows.iter().map(|r| Some(r.bids.as_slice())).collect();
    let ask_rows: Vec<Option<&[PriceLevel]>> = rows.iter().map(|r| Some(r.asks.as_slice())).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.exchange_ts_ns).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.first_update_id).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                rows.iter().map(|r| r.final_update_id).collect::<Vec<_>>(),
            )),
            Arc::new(level_list_array(&bid_rows)),
            Arc::new(level_list_array(&ask_rows)),
        ],
    )
    .unwrap();
    write_parquet(path, schema, batch);
}

fn write_parquet(path: &Path, schema: Arc<arrow::datatypes::Schema>, batch: RecordBatch) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// Seven events for symbol `btcusdt` spanning two UTC hours.
fn seed_inputs(input_root: &Path) {
    let symbol_root = input_root.join("btcusdt");
    write_snapshots_file(
        &symbol_root.join("book_snapshots/snapshots-0001.parquet"),
        &[
            SnapshotRow {
                exchange_ts_ns: BASE + 1_000,
                last_update_id: 100,
                bids: levels(&[(10_000_000_000, 100_000_000)]),
                asks: levels(&[(10_010_000_000, 200_000_000)]),
            },
            SnapshotRow {
                // Matches the reconstructed book at this point exactly.
                exchange_ts_ns: BASE + NANOS_PER_HOUR + 500,
                last_update_id: 103,
                bids: levels(&[(10_000_000_000, 100_000_000), (9_990_000_000, 100_000_000)]),
                asks: levels(&[(10_010_000_000, 150_000_000), (10_020_000_000, 300_000_000)]),
            },
        ],
    );
    write_deltas_file(
        &symbol_root.join("book_deltas/deltas-0001.parquet"),
        &[
            DeltaRow {
                exchange_ts_ns: BASE + 1_100,
                first_update_id: 101,
                final_update_id: 101,
                bids: vec![],
                asks: levels(&[(10_010_000_000, 150_000_000)]),
            },
            DeltaRow {
                exchange_ts_ns: BASE + 2_000,
                first_update_id: 102,
                final_update_id: 102,
                bids: levels(&[(9_990_000_000, 100_000_000)]),
                asks: vec![],
            },
            DeltaRow {
                exchange_ts_ns: BASE + NANOS_PER_HOUR + 100,
                first_update_id: 103,
                final_update_id: 103,
                bids: vec![],
                asks: levels(&[(10_020_000_000, 300_000_000)]),
            },
        ],
    );
    write_trades_file(
        &symbol_root.join("trades/trades-0001.parquet"),
        &[
            TradeRow {
                exchange_ts_ns: BASE + 1_200,
                trade_id: 1,
                price: 10_010_000_000,
                quantity: 50_000_000,
                side: "buy",
            },
            TradeRow {
                exchange_ts_ns: BASE + NANOS_PER_HOUR + 200,
                trade_id: 2,
                price: 10_000_000_000,
                quantity: 25_000_000,
                side: "sell",
            },
        ],
    );
}

fn worker_options(input_root: &Path, output_root: &Path, resume: bool) -> WorkerOptions {
    WorkerOptions {
        symbol: "btcusdt".to_string(),
        input_root: input_root.to_path_buf(),
        output_root: output_root.to_path_buf(),
        checkpoint_root: output_root.join("checkpoints"),
        resume,
        config: ReconConfig {
            batch_rows: 3,
            batch_age_ms: 60_000,
            ..Default::default()
        },
    }
}

fn run(options: WorkerOptions) {
    run_worker(
        options,
        Arc::new(ShutdownFlag::default()),
        Arc::new(WorkerStats::default()),
    )
    .unwrap();
}

/// Decode every committed file in manifest order.
fn committed_events(output_root: &Path) -> Vec<UnifiedEvent> {
    let symbol_root = output_root.join("btcusdt");
    let manifest = SinkManifest::load(&symbol_root, "btcusdt").unwrap();
    let mut events = Vec::new();
    for entry in &manifest.entries {
        events.extend(read_unified_file(&symbol_root.join(&entry.file)).unwrap());
    }
    events
}

#[test]
fn test_end_to_end_reconstruction() {
    let tmp = tempfile::tempdir().unwrap();
    let input_root = tmp.path().join("input");
    let output_root = tmp.path().join("output");
    seed_inputs(&input_root);

    run(worker_options(&input_root, &output_root, false));

    let events = committed_events(&output_root);
    assert_eq!(events.len(), 7);

    let kinds: Vec<EventKind> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Snapshot,
            EventKind::Delta,
            EventKind::Trade,
            EventKind::Delta,
            EventKind::Delta,
            EventKind::Trade,
            EventKind::Snapshot,
        ]
    );

    // Output is non-decreasing in (event_ts_ns, type_rank, tiebreak_seq).
    for pair in events.windows(2) {
        assert!(pair[0].key() <= pair[1].key());
    }

    // The bootstrap snapshot has zero drift; the later one measures the
    // reconstructed book against an identical snapshot.
    assert_eq!(events[0].drift_rms, Some(0.0));
    assert_eq!(events[6].drift_rms, Some(0.0));

    // Trades cross-reference the book's update id at emission time.
    assert_eq!(events[2].update_id, Some(101));
    assert_eq!(events[5].update_id, Some(103));

    // Hourly partitioning: two hours of data, manifest in time order.
    let manifest = SinkManifest::load(&output_root.join("btcusdt"), "btcusdt").unwrap();
    assert!(manifest.entries.len() >= 2);
    for pair in manifest.entries.windows(2) {
        assert!(pair[0].first_event_ts_ns <= pair[1].first_event_ts_ns);
    }
    assert!(manifest.entries.iter().any(|e| e.file.contains("hour=")));

    // Committed files re-verify (hashes, row counts, time ranges).
    let report = verify_manifest(&output_root.join("btcusdt").join(MANIFEST_FILE)).unwrap();
    assert!(report.ok(), "failures: {:?}", report.failures);

    // The terminal checkpoint reflects the final book.
    let restored = latest_checkpoint(&output_root.join("checkpoints"), "btcusdt")
        .unwrap()
        .expect("terminal checkpoint");
    assert_eq!(restored.mark.book.last_update_id, Some(103));
    assert_eq!(restored.mark.counters.events_processed, 7);
    assert!(restored.mark.book.bootstrapped);
}

#[test]
fn test_determinism_across_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let input_root = tmp.path().join("input");
    seed_inputs(&input_root);

    let out_a = tmp.path().join("out-a");
    let out_b = tmp.path().join("out-b");
    run(worker_options(&input_root, &out_a, false));
    run(worker_options(&input_root, &out_b, false));

    let manifest_a = SinkManifest::load(&out_a.join("btcusdt"), "btcusdt").unwrap();
    let manifest_b = SinkManifest::load(&out_b.join("btcusdt"), "btcusdt").unwrap();
    assert_eq!(manifest_a.entries.len(), manifest_b.entries.len());

    // Byte-identical data files; created_ts_ns is wall clock and excluded.
    for (a, b) in manifest_a.entries.iter().zip(&manifest_b.entries) {
        assert_eq!(a.file, b.file);
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.row_count, b.row_count);
        assert_eq!(a.bytes, b.bytes);
    }
}

#[test]
fn test_resume_produces_no_duplicates() {
    let tmp = tempfile::tempdir().unwrap();

    // Full reference run over both halves of the input.
    let full_input = tmp.path().join("input-full");
    seed_inputs(&full_input);
    let second_half_deltas = [DeltaRow {
        exchange_ts_ns: BASE + 2 * NANOS_PER_HOUR,
        first_update_id: 104,
        final_update_id: 104,
        bids: levels(&[(10_005_000_000, 80_000_000)]),
        asks: vec![],
    }];
    let second_half_trades = [TradeRow {
        exchange_ts_ns: BASE + 2 * NANOS_PER_HOUR + 100,
        trade_id: 3,
        price: 10_005_000_000,
        quantity: 10_000_000,
        side: "buy",
    }];
    write_deltas_file(
        &full_input.join("btcusdt/book_deltas/deltas-0002.parquet"),
        &second_half_deltas,
    );
    write_trades_file(
        &full_input.join("btcusdt/trades/trades-0002.parquet"),
        &second_half_trades,
    );
    let full_output = tmp.path().join("output-full");
    run(worker_options(&full_input, &full_output, false));
    let reference = committed_events(&full_output);
    assert_eq!(reference.len(), 9);

    // Phased run: first half, terminal checkpoint, then the second half
    // appears and the worker resumes.
    let phased_input = tmp.path().join("input-phased");
    seed_inputs(&phased_input);
    let phased_output = tmp.path().join("output-phased");
    run(worker_options(&phased_input, &phased_output, false));

    write_deltas_file(
        &phased_input.join("btcusdt/book_deltas/deltas-0002.parquet"),
        &second_half_deltas,
    );
    write_trades_file(
        &phased_input.join("btcusdt/trades/trades-0002.parquet"),
        &second_half_trades,
    );
    run(worker_options(&phased_input, &phased_output, true));

    // The union of both phases equals the uninterrupted run, with no event
    // emitted twice.
    let phased = committed_events(&phased_output);
    assert_eq!(phased, reference);
}

#[test]
fn test_cli_run_and_verify() {
    let tmp = tempfile::tempdir().unwrap();
    let input_root = tmp.path().join("input");
    let output_root = tmp.path().join("output");
    seed_inputs(&input_root);

    let bin = PathBuf::from(env!("CARGO_BIN_EXE_reconstruct"));
    let status = std::process::Command::new(&bin)
        .args([
            "run",
            "--symbol",
            "btcusdt",
            "--input-root",
            input_root.to_str().unwrap(),
            "--output-root",
            output_root.to_str().unwrap(),
        ])
        .status()
        .unwrap();
    assert!(status.success());

    let manifest_path = output_root.join("btcusdt").join(MANIFEST_FILE);
    assert!(manifest_path.exists());

    let status = std::process::Command::new(&bin)
        .args(["verify", "--manifest", manifest_path.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(status.success());

    // Tamper with a committed file: verification must fail.
    let manifest = SinkManifest::load(&output_root.join("btcusdt"), "btcusdt").unwrap();
    let victim = output_root.join("btcusdt").join(&manifest.entries[0].file);
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[20] ^= 0xff;
    std::fs::write(&victim, bytes).unwrap();

    let status = std::process::Command::new(&bin)
        .args(["verify", "--manifest", manifest_path.to_str().unwrap()])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
