//! Symbol Worker
//!
//! Owns one symbol's pipeline end to end: reader/merger thread -> bounded
//! event queue -> replay thread -> bounded batch channel -> sink thread ->
//! checkpoint thread. The bounded channels are the only backpressure
//! mechanism: a full queue blocks the merger, which stops the readers from
//! pulling chunks.
//!
//! Shutdown is cooperative. Graceful stop drains in-flight events, flushes
//! the final batch and writes a terminal checkpoint; emergency stop abandons
//! the open batch and gives the checkpointer the configured grace to persist
//! the last committed mark.

use crate::recon::checkpoint::{latest_checkpoint, Checkpointer};
use crate::recon::config::ReconConfig;
use crate::recon::error::ReconError;
use crate::recon::events::UnifiedEvent;
use crate::recon::merge::{EventMerger, SourcedEvent};
use crate::recon::reader::{StreamKind, StreamReader, DEFAULT_CHUNK_ROWS};
use crate::recon::replay::{ReplayEngine, ReplayMark, ReplayState};
use crate::recon::sink::ColumnarSink;
use crossbeam::channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Mark capture beyond this budget logs `CheckpointSnapshotSlow`.
const MARK_BUDGET: Duration = Duration::from_millis(100);

/// Worker invocation parameters.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub symbol: String,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub checkpoint_root: PathBuf,
    pub resume: bool,
    pub config: ReconConfig,
}

/// Cooperative shutdown request shared across tasks.
#[derive(Debug, Default)]
pub struct ShutdownFlag(AtomicU8);

const RUN: u8 = 0;
const GRACEFUL: u8 = 1;
const EMERGENCY: u8 = 2;

impl ShutdownFlag {
    pub fn request_graceful(&self) {
        let _ = self
            .0
            .compare_exchange(RUN, GRACEFUL, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn request_emergency(&self) {
        self.0.store(EMERGENCY, Ordering::SeqCst);
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) != RUN
    }

    #[inline]
    pub fn is_emergency(&self) -> bool {
        self.0.load(Ordering::SeqCst) == EMERGENCY
    }
}

/// Live counters sampled by the heartbeat task.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub events_processed: AtomicU64,
    pub last_event_ts_ns: AtomicU64,
    pub queue_depth: AtomicUsize,
    pub drift_alert_count: AtomicU64,
    state: AtomicU8,
}

impl WorkerStats {
    fn set_state(&self, state: ReplayState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::Relaxed) {
            0 => "uninitialized",
            1 => "bootstrapping",
            2 => "running",
            3 => "draining",
            _ => "terminated",
        }
    }
}

/// One heartbeat line, emitted as JSON on worker stdout once per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub symbol: String,
    pub events_processed: u64,
    pub last_event_ts_ns: u64,
    pub queue_depth: usize,
    pub drift_alert_count: u64,
    pub state: String,
}

impl Heartbeat {
    pub fn sample(symbol: &str, stats: &WorkerStats) -> Self {
        Heartbeat {
            symbol: symbol.to_string(),
            events_processed: stats.events_processed.load(Ordering::Relaxed),
            last_event_ts_ns: stats.last_event_ts_ns.load(Ordering::Relaxed),
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
            drift_alert_count: stats.drift_alert_count.load(Ordering::Relaxed),
            state: stats.state_name().to_string(),
        }
    }
}

/// Batch handed from the replay thread to the sink thread.
struct SinkJob {
    events: Vec<UnifiedEvent>,
    /// Resume point consistent with this batch, when available.
    mark: Option<ReplayMark>,
    terminal: bool,
}

/// Committed mark forwarded to the checkpoint thread.
struct CheckpointJob {
    mark: ReplayMark,
    sink_seq: u64,
    terminal: bool,
}

/// First fatal error across pipeline threads.
#[derive(Default)]
struct FailureSlot(Mutex<Option<ReconError>>);

impl FailureSlot {
    fn set(&self, err: ReconError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<ReconError> {
        self.0.lock().take()
    }

    fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }
}

/// Run one symbol's pipeline to completion. Blocking; returns when input is
/// exhausted, a fatal error occurs, or shutdown is requested.
pub fn run_worker(
    options: WorkerOptions,
    shutdown: Arc<ShutdownFlag>,
    stats: Arc<WorkerStats>,
) -> Result<(), ReconError> {
    options.config.validate()?;

    let restored = if options.resume {
        latest_checkpoint(&options.checkpoint_root, &options.symbol)?
    } else {
        None
    };

    let (trades, snapshots, deltas) = match &restored {
        Some(r) => (
            StreamReader::open_at(
                &options.input_root,
                &options.symbol,
                StreamKind::Trades,
                DEFAULT_CHUNK_ROWS,
                Some(&r.mark.positions.trades),
            )?,
            StreamReader::open_at(
                &options.input_root,
                &options.symbol,
                StreamKind::Snapshots,
                DEFAULT_CHUNK_ROWS,
                Some(&r.mark.positions.snapshots),
            )?,
            StreamReader::open_at(
                &options.input_root,
                &options.symbol,
                StreamKind::Deltas,
                DEFAULT_CHUNK_ROWS,
                Some(&r.mark.positions.deltas),
            )?,
        ),
        None => (
            StreamReader::open(
                &options.input_root,
                &options.symbol,
                StreamKind::Trades,
                DEFAULT_CHUNK_ROWS,
            )?,
            StreamReader::open(
                &options.input_root,
                &options.symbol,
                StreamKind::Snapshots,
                DEFAULT_CHUNK_ROWS,
            )?,
            StreamReader::open(
                &options.input_root,
                &options.symbol,
                StreamKind::Deltas,
                DEFAULT_CHUNK_ROWS,
            )?,
        ),
    };

    let mut merger = EventMerger::new(trades, snapshots, deltas);
    let engine = match &restored {
        Some(r) => {
            // The first emitted event after resume is strictly beyond the
            // checkpoint watermark.
            if let Some(watermark) = r.mark.watermark {
                let skipped = merger.skip_through(watermark)?;
                if skipped > 0 {
                    info!(skipped, "discarded events at or before resume watermark");
                }
            }
            info!(
                symbol = %options.symbol,
                events_processed = r.mark.counters.events_processed,
                sink_seq = r.sink_seq,
                "resuming from checkpoint"
            );
            ReplayEngine::resume(options.config.clone(), &r.mark)
        }
        None => ReplayEngine::new(options.config.clone()),
    };

    let sink = ColumnarSink::open(&options.output_root, &options.symbol, options.config.clone())?;
    let mut checkpointer =
        Checkpointer::open(&options.checkpoint_root, &options.symbol, &options.config)?;

    let (event_tx, event_rx) = bounded::<SourcedEvent>(options.config.queue_capacity);
    let (batch_tx, batch_rx) = bounded::<SinkJob>(2);
    let (ckpt_tx, ckpt_rx) = bounded::<CheckpointJob>(8);

    let failure = FailureSlot::default();
    let batch_rows = options.config.batch_rows;
    let batch_age = Duration::from_millis(options.config.batch_age_ms);
    let symbol = options.symbol.clone();

    std::thread::scope(|scope| {
        // Reader/merger task: pull from the readers, push into the bounded
        // queue. A full queue parks this thread.
        let producer = scope.spawn({
            let shutdown = &shutdown;
            let failure = &failure;
            move || {
                loop {
                    if shutdown.stop_requested() {
                        break;
                    }
                    match merger.next_event() {
                        Ok(Some(event)) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            failure.set(e);
                            break;
                        }
                    }
                }
                // Dropping the sender lets the replay thread drain.
            }
        });

        // Replay task: drive the state machine, assemble micro-batches.
        let replay = scope.spawn({
            let shutdown = &shutdown;
            let failure = &failure;
            let stats = &stats;
            let mut engine = engine;
            move || {
                let mut batch: Vec<UnifiedEvent> = Vec::with_capacity(batch_rows);
                let mut batch_started = Instant::now();

                let flush = |batch: &mut Vec<UnifiedEvent>,
                             engine: &ReplayEngine,
                             terminal: bool|
                 -> Result<(), ()> {
                    if batch.is_empty() && !terminal {
                        return Ok(());
                    }
                    let mark_started = Instant::now();
                    let mark = engine.mark();
                    if mark_started.elapsed() > MARK_BUDGET {
                        warn!(
                            elapsed_ms = mark_started.elapsed().as_millis() as u64,
                            "CheckpointSnapshotSlow: mark capture exceeded budget"
                        );
                    }
                    batch_tx
                        .send(SinkJob {
                            events: std::mem::take(batch),
                            mark,
                            terminal,
                        })
                        .map_err(|_| ())
                };

                loop {
                    if shutdown.is_emergency() {
                        // Abandon the open batch; the checkpointer keeps the
                        // last committed mark.
                        return;
                    }
                    match event_rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(event) => {
                            match engine.process(event) {
                                Ok(out) => batch.extend(out),
                                Err(e) => {
                                    failure.set(e);
                                    return;
                                }
                            }
                            stats
                                .events_processed
                                .store(engine.counters().events_processed, Ordering::Relaxed);
                            stats
                                .last_event_ts_ns
                                .store(engine.last_event_ts_ns(), Ordering::Relaxed);
                            stats
                                .drift_alert_count
                                .store(engine.drift_alert_count(), Ordering::Relaxed);
                            stats.queue_depth.store(event_rx.len(), Ordering::Relaxed);
                            stats.set_state(engine.state());

                            if batch.len() >= batch_rows
                                && flush(&mut batch, &engine, false).is_err()
                            {
                                return;
                            }
                            if batch.is_empty() {
                                batch_started = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !batch.is_empty()
                                && batch_started.elapsed() >= batch_age
                                && flush(&mut batch, &engine, false).is_err()
                            {
                                return;
                            }
                            if batch.is_empty() {
                                batch_started = Instant::now();
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            if failure.is_set() {
                                return;
                            }
                            // Drain: flush remaining output and the terminal
                            // checkpoint mark.
                            stats.set_state(ReplayState::Draining);
                            batch.extend(engine.finish());
                            let _ = flush(&mut batch, &engine, true);
                            stats.set_state(ReplayState::Terminated);
                            return;
                        }
                    }
                }
            }
        });

        // Sink task: persist batches, forward committed marks.
        let sink_thread = scope.spawn({
            let failure = &failure;
            let mut sink = sink;
            move || {
                while let Ok(job) = batch_rx.recv() {
                    match sink.write_batch(&job.events) {
                        Ok(_) => {
                            if let Some(mark) = job.mark {
                                let _ = ckpt_tx.send(CheckpointJob {
                                    mark,
                                    sink_seq: sink.committed_seq(),
                                    terminal: job.terminal,
                                });
                            }
                        }
                        Err(e) => {
                            failure.set(e);
                            return;
                        }
                    }
                    if job.terminal {
                        return;
                    }
                }
            }
        });

        // Checkpoint task: persist marks on triggers and at termination.
        let ckpt_thread = scope.spawn({
            let shutdown = &shutdown;
            let failure = &failure;
            let symbol = symbol.clone();
            move || {
                let mut last_unwritten: Option<(ReplayMark, u64)> = None;
                while let Ok(job) = ckpt_rx.recv() {
                    if job.terminal || checkpointer.due(job.mark.counters.events_processed) {
                        if let Err(e) = checkpointer.write(&job.mark, job.sink_seq) {
                            failure.set(e);
                            return;
                        }
                        last_unwritten = None;
                    } else {
                        last_unwritten = Some((job.mark, job.sink_seq));
                    }
                }
                // Emergency stop: one final attempt inside the grace window.
                if shutdown.is_emergency() {
                    if let Some((mark, sink_seq)) = last_unwritten {
                        info!(symbol = %symbol, "persisting final checkpoint before emergency exit");
                        if let Err(e) = checkpointer.write(&mark, sink_seq) {
                            warn!(error = %e, "final checkpoint failed");
                        }
                    }
                }
            }
        });

        producer.join().expect("reader/merger thread panicked");
        replay.join().expect("replay thread panicked");
        sink_thread.join().expect("sink thread panicked");
        ckpt_thread.join().expect("checkpoint thread panicked");
    });

    match failure.take() {
        Some(err) => Err(err),
        None => {
            info!(symbol = %options.symbol, "worker finished cleanly");
            Ok(())
        }
    }
}
