//! Replay Engine
//!
//! The state machine driving reconstruction: consumes the merged input
//! stream, applies snapshots and deltas to the book, measures drift, detects
//! and repairs sequence gaps, and emits the unified output stream.
//!
//! States: `Uninitialized -> Bootstrapping -> Running -> Draining ->
//! Terminated`. While bootstrapping, deltas and trades are buffered until
//! the first snapshot arrives; buffered trades are emitted before the
//! snapshot event so the output keeps its deterministic order.

use crate::recon::book::{BookLevels, OrderBook};
use crate::recon::config::ReconConfig;
use crate::recon::drift::{DriftMeasurement, DriftTracker};
use crate::recon::error::ReconError;
use crate::recon::events::{
    DeltaRecord, MarketEvent, OrderKey, SnapshotRecord, TradeRecord, UnifiedEvent,
};
use crate::recon::merge::SourcedEvent;
use crate::recon::reader::{ReaderPosition, StreamKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Trades held before bootstrap; overflow is fatal like the delta buffer.
const TRADE_HOLD_CAPACITY: usize = 8_192;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayState {
    Uninitialized,
    Bootstrapping,
    Running,
    Draining,
    Terminated,
}

/// Counters surfaced in heartbeats and checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCounters {
    pub events_processed: u64,
    pub trades_emitted: u64,
    pub deltas_applied: u64,
    pub snapshots_observed: u64,
    /// Deltas ignored because their range was already applied (B2).
    pub duplicate_delta_count: u64,
    /// Deltas discarded while draining the bootstrap buffer.
    pub bootstrap_discarded: u64,
    pub gap_count: u64,
    /// Total missing update ids across all gaps.
    pub gap_span_total: u64,
    pub gap_repaired_count: u64,
    pub gap_unrepaired_count: u64,
    pub gap_discarded_count: u64,
    pub hard_resync_count: u64,
    pub snapshot_behind_count: u64,
    pub crossed_book_count: u64,
}

/// Last-consumed position of each input stream, advanced per processed
/// event. Together with the watermark this is the exact resume point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPositions {
    pub trades: ReaderPosition,
    pub snapshots: ReaderPosition,
    pub deltas: ReaderPosition,
}

impl StreamPositions {
    fn update(&mut self, stream: StreamKind, position: ReaderPosition) {
        match stream {
            StreamKind::Trades => self.trades = position,
            StreamKind::Snapshots => self.snapshots = position,
            StreamKind::Deltas => self.deltas = position,
        }
    }
}

/// Consistent engine snapshot captured at a sink-batch boundary.
///
/// Only available when every consumed input event has been emitted
/// downstream (no bootstrap or repair buffers outstanding), so the recorded
/// positions and watermark agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMark {
    pub book: BookLevels,
    pub positions: StreamPositions,
    pub counters: ReplayCounters,
    /// Key of the last emitted output event.
    pub watermark: Option<OrderKey>,
    pub last_event_ts_ns: u64,
    /// Whether the next accepted delta may overlap the book id (a snapshot
    /// was applied and no delta has chained onto it yet).
    pub seam: bool,
}

/// Forward-repair buffer for a sequence gap (§ gap policy).
#[derive(Debug)]
struct GapRepair {
    /// Buffered deltas in arrival order with their tie-break sequences.
    deltas: Vec<(DeltaRecord, u64)>,
    min_first: u64,
    max_final: u64,
    /// Window exhausted; next snapshot hard-resyncs regardless of drift.
    failed: bool,
}

impl GapRepair {
    fn new() -> Self {
        GapRepair {
            deltas: Vec::new(),
            min_first: u64::MAX,
            max_final: 0,
            failed: false,
        }
    }

    fn push(&mut self, delta: DeltaRecord, seq: u64) {
        self.min_first = self.min_first.min(delta.first_update_id);
        self.max_final = self.max_final.max(delta.final_update_id);
        self.deltas.push((delta, seq));
    }
}

/// The reconstruction state machine.
pub struct ReplayEngine {
    config: ReconConfig,
    state: ReplayState,
    book: OrderBook,
    drift: DriftTracker,
    counters: ReplayCounters,
    positions: StreamPositions,
    /// Deltas buffered before the first snapshot.
    pending_deltas: VecDeque<(DeltaRecord, u64)>,
    /// Trades held before the first snapshot.
    held_trades: VecDeque<(TradeRecord, u64)>,
    /// Active gap-repair window, if any.
    repair: Option<GapRepair>,
    /// A snapshot was just applied; the next accepted delta may overlap it.
    seam: bool,
    last_emitted_key: Option<OrderKey>,
    last_event_ts_ns: u64,
}

impl ReplayEngine {
    pub fn new(config: ReconConfig) -> Self {
        let drift = DriftTracker::new(config.drift_rms_warn);
        ReplayEngine {
            config,
            state: ReplayState::Uninitialized,
            book: OrderBook::new(),
            drift,
            counters: ReplayCounters::default(),
            positions: StreamPositions::default(),
            pending_deltas: VecDeque::new(),
            held_trades: VecDeque::new(),
            repair: None,
            seam: false,
            last_emitted_key: None,
            last_event_ts_ns: 0,
        }
    }

    /// Rebuild an engine from a checkpointed mark.
    pub fn resume(config: ReconConfig, mark: &ReplayMark) -> Self {
        let mut engine = ReplayEngine::new(config);
        engine.book = OrderBook::restore(&mark.book);
        engine.counters = mark.counters.clone();
        engine.positions = mark.positions.clone();
        engine.last_emitted_key = mark.watermark;
        engine.last_event_ts_ns = mark.last_event_ts_ns;
        engine.state = if mark.book.bootstrapped {
            ReplayState::Running
        } else {
            ReplayState::Uninitialized
        };
        engine.seam = mark.seam;
        engine
    }

    #[inline]
    pub fn state(&self) -> ReplayState {
        self.state
    }

    #[inline]
    pub fn counters(&self) -> &ReplayCounters {
        &self.counters
    }

    #[inline]
    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    #[inline]
    pub fn drift_alert_count(&self) -> u64 {
        self.drift.alert_count()
    }

    #[inline]
    pub fn last_event_ts_ns(&self) -> u64 {
        self.last_event_ts_ns
    }

    /// Consistent resume point, if no consumed event is still buffered.
    pub fn mark(&self) -> Option<ReplayMark> {
        let buffers_clear = self.pending_deltas.is_empty()
            && self.held_trades.is_empty()
            && self.repair.is_none();
        if !buffers_clear {
            return None;
        }
        Some(ReplayMark {
            book: self.book.clone_levels(),
            positions: self.positions.clone(),
            counters: self.counters.clone(),
            watermark: self.last_emitted_key,
            last_event_ts_ns: self.last_event_ts_ns,
            seam: self.seam,
        })
    }

    /// Process one merged input event, returning the unified events to emit.
    pub fn process(&mut self, sourced: SourcedEvent) -> Result<Vec<UnifiedEvent>, ReconError> {
        if self.state == ReplayState::Uninitialized {
            self.state = ReplayState::Bootstrapping;
        }
        self.counters.events_processed += 1;
        self.last_event_ts_ns = sourced.event.exchange_ts_ns();
        self.positions
            .update(sourced.stream, sourced.position.clone());

        let seq = sourced.tiebreak_seq;
        let out = match sourced.event {
            MarketEvent::Trade(trade) => self.on_trade(trade, seq)?,
            MarketEvent::Delta(delta) => self.on_delta(delta, seq)?,
            MarketEvent::Snapshot(snap) => self.on_snapshot(snap, seq)?,
        };
        for event in &out {
            self.last_emitted_key = Some(event.key());
        }
        Ok(out)
    }

    /// Input exhausted: flush whatever can still be emitted and terminate.
    pub fn finish(&mut self) -> Vec<UnifiedEvent> {
        self.state = ReplayState::Draining;
        let mut out = Vec::new();

        // Trades held for a snapshot that never came still carry
        // information; emit them without a book cross-reference.
        while let Some((trade, seq)) = self.held_trades.pop_front() {
            self.counters.trades_emitted += 1;
            out.push(UnifiedEvent::from_trade(&trade, None, seq));
        }
        // Un-repaired buffered deltas cannot be validated without the
        // missing segment; they are dropped and accounted.
        if let Some(repair) = self.repair.take() {
            let dropped = repair.deltas.len() as u64;
            if dropped > 0 {
                self.counters.gap_discarded_count += dropped;
                warn!(discarded = dropped, "gap repair abandoned at end of input");
            }
        }
        let dropped = self.pending_deltas.len() as u64;
        if dropped > 0 {
            self.counters.bootstrap_discarded += dropped;
            self.pending_deltas.clear();
            warn!(discarded = dropped, "bootstrap never completed; deltas dropped");
        }

        for event in &out {
            self.last_emitted_key = Some(event.key());
        }
        self.state = ReplayState::Terminated;
        out
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    fn on_trade(&mut self, trade: TradeRecord, seq: u64) -> Result<Vec<UnifiedEvent>, ReconError> {
        if self.state == ReplayState::Bootstrapping {
            if self.held_trades.len() >= TRADE_HOLD_CAPACITY {
                return Err(ReconError::BootstrapOverflow {
                    kind: "trade",
                    capacity: TRADE_HOLD_CAPACITY,
                });
            }
            self.held_trades.push_back((trade, seq));
            return Ok(Vec::new());
        }

        // Trades never mutate the book: upstream deltas already reflect
        // trade-induced consumption.
        self.counters.trades_emitted += 1;
        Ok(vec![UnifiedEvent::from_trade(
            &trade,
            self.book.last_update_id(),
            seq,
        )])
    }

    // ------------------------------------------------------------------
    // Deltas
    // ------------------------------------------------------------------

    fn on_delta(&mut self, delta: DeltaRecord, seq: u64) -> Result<Vec<UnifiedEvent>, ReconError> {
        if self.state == ReplayState::Bootstrapping {
            if self.pending_deltas.len() >= self.config.pending_delta_capacity {
                return Err(ReconError::BootstrapOverflow {
                    kind: "delta",
                    capacity: self.config.pending_delta_capacity,
                });
            }
            self.pending_deltas.push_back((delta, seq));
            return Ok(Vec::new());
        }
        self.on_delta_running(delta, seq)
    }

    fn on_delta_running(
        &mut self,
        delta: DeltaRecord,
        seq: u64,
    ) -> Result<Vec<UnifiedEvent>, ReconError> {
        if let Some(repair) = self.repair.as_mut() {
            if repair.failed {
                self.counters.gap_discarded_count += 1;
                return Ok(Vec::new());
            }
            repair.push(delta, seq);
            if repair.deltas.len() > self.config.max_repair_events {
                let dropped = repair.deltas.len() as u64;
                repair.deltas.clear();
                repair.failed = true;
                self.counters.gap_discarded_count += dropped;
                warn!(
                    discarded = dropped,
                    window = self.config.max_repair_events,
                    "forward repair window exhausted; awaiting snapshot resync"
                );
            }
            return Ok(Vec::new());
        }

        let last = self
            .book
            .last_update_id()
            .expect("running implies bootstrapped");

        // Already applied (B2): the whole range is at or below our id.
        if delta.final_update_id <= last {
            self.counters.duplicate_delta_count += 1;
            return Ok(Vec::new());
        }

        // Directly after a snapshot the accepted delta may overlap its id
        // (first <= last+1 <= final); mid-stream the chain is strict.
        let chains = if self.seam {
            delta.first_update_id <= last + 1
        } else {
            delta.first_update_id == last + 1
        };

        if !chains {
            if delta.first_update_id <= last {
                // Overlapping range mid-stream; its new portion cannot be
                // isolated, so it is treated as already applied.
                self.counters.duplicate_delta_count += 1;
                return Ok(Vec::new());
            }
            self.begin_repair(last, delta, seq);
            return Ok(Vec::new());
        }

        self.apply_delta(&delta);
        Ok(vec![UnifiedEvent::from_delta(&delta, seq)])
    }

    fn apply_delta(&mut self, delta: &DeltaRecord) {
        self.book
            .apply_delta_levels(&delta.bids, &delta.asks, delta.final_update_id);
        self.seam = false;
        self.counters.deltas_applied += 1;
        if self.book.is_crossed() {
            self.counters.crossed_book_count += 1;
            warn!(
                update_id = delta.final_update_id,
                best_bid = ?self.book.best_bid(),
                best_ask = ?self.book.best_ask(),
                "crossed book after delta"
            );
        }
    }

    fn begin_repair(&mut self, last: u64, delta: DeltaRecord, seq: u64) {
        let expected = last + 1;
        let span = delta.first_update_id - expected;
        self.counters.gap_count += 1;
        self.counters.gap_span_total += span;
        warn!(
            last_update_id = last,
            first_update_id = delta.first_update_id,
            final_update_id = delta.final_update_id,
            missing = span,
            "GapDetected: buffering deltas for forward repair"
        );
        let mut repair = GapRepair::new();
        repair.push(delta, seq);
        self.repair = Some(repair);
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    fn on_snapshot(
        &mut self,
        snap: SnapshotRecord,
        seq: u64,
    ) -> Result<Vec<UnifiedEvent>, ReconError> {
        self.counters.snapshots_observed += 1;

        if self.state == ReplayState::Bootstrapping {
            return self.bootstrap(snap, seq);
        }

        let measurement = self.drift.observe(&self.book, &snap);

        if self.repair.is_some() {
            return self.resolve_repair(snap, seq, measurement);
        }

        let last = self
            .book
            .last_update_id()
            .expect("running implies bootstrapped");
        let id_distance = last.abs_diff(snap.last_update_id);

        if measurement.rms_qty_err > self.config.drift_rms_hard_reset
            || id_distance > self.config.max_drift_updates
        {
            self.counters.hard_resync_count += 1;
            warn!(
                rms_qty_err = measurement.rms_qty_err,
                id_distance,
                snapshot_update_id = snap.last_update_id,
                "HardResync: replacing book from snapshot"
            );
            self.book.apply_snapshot(&snap);
            self.seam = true;
        } else if snap.last_update_id < last {
            // Behind snapshots only feed drift measurement.
            self.counters.snapshot_behind_count += 1;
            debug!(
                snapshot_update_id = snap.last_update_id,
                last_update_id = last,
                "SnapshotBehind: drift measurement only"
            );
        }

        Ok(vec![UnifiedEvent::from_snapshot(
            &snap,
            measurement.rms_qty_err,
            seq,
        )])
    }

    /// First snapshot: seed the book, release held trades, drain the
    /// pending delta buffer through the normal acceptance rules.
    fn bootstrap(&mut self, snap: SnapshotRecord, seq: u64) -> Result<Vec<UnifiedEvent>, ReconError> {
        self.book.apply_snapshot(&snap);
        self.seam = true;
        self.state = ReplayState::Running;

        let mut out = Vec::new();
        // Held trades precede the snapshot in merge order; emitting them
        // first keeps the output key-sorted.
        while let Some((trade, trade_seq)) = self.held_trades.pop_front() {
            self.counters.trades_emitted += 1;
            out.push(UnifiedEvent::from_trade(
                &trade,
                self.book.last_update_id(),
                trade_seq,
            ));
        }
        out.push(UnifiedEvent::from_snapshot(&snap, 0.0, seq));

        let pending: Vec<(DeltaRecord, u64)> = self.pending_deltas.drain(..).collect();
        let mut discarded = 0u64;
        for (delta, delta_seq) in pending {
            if delta.final_update_id <= snap.last_update_id {
                discarded += 1;
                continue;
            }
            out.extend(self.on_delta_running(delta, delta_seq)?);
        }
        self.counters.bootstrap_discarded += discarded;

        info!(
            last_update_id = snap.last_update_id,
            discarded_deltas = discarded,
            "bootstrap complete"
        );
        Ok(out)
    }

    /// A snapshot arrived while a gap-repair window is open.
    fn resolve_repair(
        &mut self,
        snap: SnapshotRecord,
        seq: u64,
        measurement: DriftMeasurement,
    ) -> Result<Vec<UnifiedEvent>, ReconError> {
        let repair = self.repair.take().expect("repair window open");
        let mut out = Vec::new();

        if repair.failed {
            // Window exhausted earlier: unconditional resync.
            self.counters.gap_unrepaired_count += 1;
            self.counters.hard_resync_count += 1;
            warn!(
                snapshot_update_id = snap.last_update_id,
                "GapUnrepaired: hard resync from snapshot"
            );
            self.book.apply_snapshot(&snap);
            self.seam = true;
            out.push(UnifiedEvent::from_snapshot(
                &snap,
                measurement.rms_qty_err,
                seq,
            ));
            return Ok(out);
        }

        if snap.last_update_id + 1 < repair.min_first {
            // Snapshot predates the gap; it cannot seed the buffered chain.
            self.counters.snapshot_behind_count += 1;
            debug!(
                snapshot_update_id = snap.last_update_id,
                buffered_first = repair.min_first,
                "snapshot behind open gap; repair continues"
            );
            out.push(UnifiedEvent::from_snapshot(
                &snap,
                measurement.rms_qty_err,
                seq,
            ));
            self.repair = Some(repair);
            return Ok(out);
        }

        // The snapshot covers the missing segment: resync and replay the
        // buffered tail beyond it, in original order.
        self.counters.gap_repaired_count += 1;
        info!(
            snapshot_update_id = snap.last_update_id,
            buffered = repair.deltas.len(),
            "GapRepaired: snapshot covers missing segment"
        );
        self.book.apply_snapshot(&snap);
        self.seam = true;
        out.push(UnifiedEvent::from_snapshot(
            &snap,
            measurement.rms_qty_err,
            seq,
        ));

        for (delta, delta_seq) in repair.deltas {
            if delta.final_update_id <= snap.last_update_id {
                continue;
            }
            out.extend(self.on_delta_running(delta, delta_seq)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recon::events::{EventKind, PriceLevel, Side};
    use crate::recon::fixed::FixedPoint;

    fn fp(raw: i64) -> FixedPoint {
        FixedPoint::from_raw(raw)
    }

    fn levels(raw: &[(i64, i64)]) -> Vec<PriceLevel> {
        raw.iter().map(|&(p, q)| (fp(p), fp(q))).collect()
    }

    fn sourced(event: MarketEvent, seq: u64) -> SourcedEvent {
        let stream = match event.kind() {
            EventKind::Trade => StreamKind::Trades,
            EventKind::Snapshot => StreamKind::Snapshots,
            EventKind::Delta => StreamKind::Deltas,
        };
        SourcedEvent {
            event,
            tiebreak_seq: seq,
            stream,
            position: ReaderPosition::default(),
        }
    }

    fn snapshot(ts: u64, last_update_id: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> MarketEvent {
        MarketEvent::Snapshot(SnapshotRecord {
            exchange_ts_ns: ts,
            last_update_id,
            bids: levels(bids),
            asks: levels(asks),
        })
    }

    fn delta(ts: u64, first: u64, last: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> MarketEvent {
        MarketEvent::Delta(DeltaRecord {
            exchange_ts_ns: ts,
            first_update_id: first,
            final_update_id: last,
            bids: levels(bids),
            asks: levels(asks),
        })
    }

    fn trade(ts: u64, id: u64, price: i64, qty: i64) -> MarketEvent {
        MarketEvent::Trade(TradeRecord {
            exchange_ts_ns: ts,
            origin_ts_ns: ts,
            trade_id: id,
            price: fp(price),
            quantity: fp(qty),
            side: Side::Buy,
        })
    }

    fn engine() -> ReplayEngine {
        ReplayEngine::new(ReconConfig::default())
    }

    /// Bootstrap then advance: snapshot, chained delta, trade.
    #[test]
    fn test_bootstrap_then_advance() {
        let mut engine = engine();

        let out = engine
            .process(sourced(
                snapshot(
                    1000,
                    100,
                    &[(10_000_000_000, 100_000_000)],
                    &[(10_010_000_000, 200_000_000)],
                ),
                0,
            ))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Snapshot);
        assert_eq!(out[0].drift_rms, Some(0.0));
        assert_eq!(engine.state(), ReplayState::Running);

        let out = engine
            .process(sourced(
                delta(1100, 101, 101, &[], &[(10_010_000_000, 150_000_000)]),
                0,
            ))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Delta);
        assert_eq!(out[0].update_id, Some(101));

        let out = engine
            .process(sourced(trade(1200, 1, 10_010_000_000, 50_000_000), 0))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Trade);
        assert_eq!(out[0].trade_id, Some(1));
        // Trades carry the book's id as a cross-reference, not a mutation.
        assert_eq!(out[0].update_id, Some(101));

        let book = engine.book();
        assert_eq!(book.last_update_id(), Some(101));
        assert_eq!(book.bid_qty(fp(10_000_000_000)), Some(fp(100_000_000)));
        assert_eq!(book.ask_qty(fp(10_010_000_000)), Some(fp(150_000_000)));
    }

    /// Seam rule (B1): snapshot K then delta first=K+1 runs without error.
    #[test]
    fn test_seam_exact_chain() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        let out = engine
            .process(sourced(delta(1100, 101, 101, &[(100, 20)], &[]), 0))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(engine.counters().gap_count, 0);
        assert_eq!(engine.book().last_update_id(), Some(101));
    }

    /// Seam overlap (I4): first <= K+1 <= final is applied at the seam.
    #[test]
    fn test_seam_overlap_applied() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        let out = engine
            .process(sourced(delta(1100, 99, 102, &[(100, 30)], &[]), 0))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(engine.book().last_update_id(), Some(102));
        assert_eq!(engine.counters().duplicate_delta_count, 0);
    }

    /// Pre-bootstrap deltas at or below the snapshot id are discarded, the
    /// rest replayed (transition contract).
    #[test]
    fn test_bootstrap_drains_pending_deltas() {
        let mut engine = engine();
        engine
            .process(sourced(delta(900, 99, 99, &[(100, 5)], &[]), 0))
            .unwrap();
        engine
            .process(sourced(delta(950, 100, 101, &[(100, 7)], &[]), 1))
            .unwrap();

        let out = engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        // Snapshot event plus the replayed delta that extends past it.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event_type, EventKind::Snapshot);
        assert_eq!(out[1].event_type, EventKind::Delta);
        assert_eq!(engine.counters().bootstrap_discarded, 1);
        assert_eq!(engine.book().last_update_id(), Some(101));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(7)));
    }

    /// Trades before bootstrap are held and released ahead of the snapshot
    /// event in output order.
    #[test]
    fn test_held_trades_released_in_order() {
        let mut engine = engine();
        assert!(engine
            .process(sourced(trade(800, 1, 100, 10), 0))
            .unwrap()
            .is_empty());
        assert!(engine
            .process(sourced(trade(900, 2, 100, 10), 1))
            .unwrap()
            .is_empty());

        let out = engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].trade_id, Some(1));
        assert_eq!(out[1].trade_id, Some(2));
        assert_eq!(out[2].event_type, EventKind::Snapshot);
        for pair in out.windows(2) {
            assert!(pair[0].key() <= pair[1].key());
        }
    }

    /// B2: a duplicate delta is silently ignored and counted.
    #[test]
    fn test_duplicate_delta_ignored() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(1100, 101, 101, &[(100, 20)], &[]), 0))
            .unwrap();

        let out = engine
            .process(sourced(delta(1200, 101, 101, &[(100, 99)], &[]), 1))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.counters().duplicate_delta_count, 1);
        // Book unchanged by the duplicate.
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(20)));
    }

    /// S3: a gap is forward-repaired by a covering snapshot; the buffered
    /// delta inside the snapshot range is discarded.
    #[test]
    fn test_gap_repaired_by_snapshot() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 300, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();

        // Gap: expected 301, got 305.
        let out = engine
            .process(sourced(delta(3000, 305, 306, &[(100, 50)], &[]), 1))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.counters().gap_count, 1);
        assert_eq!(engine.counters().gap_span_total, 4);

        let out = engine
            .process(sourced(snapshot(3100, 306, &[(100, 60)], &[(200, 10)]), 1))
            .unwrap();
        // Only the snapshot event: the buffered delta is inside its range.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Snapshot);
        assert!(out[0].drift_rms.is_some());
        assert_eq!(engine.counters().gap_repaired_count, 1);
        assert_eq!(engine.book().last_update_id(), Some(306));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(60)));
    }

    /// Buffered deltas beyond the covering snapshot are replayed in order.
    #[test]
    fn test_gap_repair_replays_tail() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 300, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(3000, 305, 306, &[(100, 50)], &[]), 1))
            .unwrap();
        engine
            .process(sourced(delta(3010, 307, 307, &[(100, 70)], &[]), 2))
            .unwrap();

        let out = engine
            .process(sourced(snapshot(3100, 306, &[(100, 60)], &[(200, 10)]), 1))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event_type, EventKind::Snapshot);
        assert_eq!(out[1].event_type, EventKind::Delta);
        assert_eq!(out[1].update_id, Some(307));
        assert_eq!(engine.book().last_update_id(), Some(307));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(70)));
    }

    /// S4: window exhaustion forces a hard resync on the next snapshot.
    #[test]
    fn test_gap_unrepaired_hard_resync() {
        let config = ReconConfig {
            max_repair_events: 2,
            ..Default::default()
        };
        let mut engine = ReplayEngine::new(config);
        engine
            .process(sourced(snapshot(1000, 300, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(3000, 305, 305, &[], &[]), 1))
            .unwrap();
        engine
            .process(sourced(delta(3010, 306, 306, &[], &[]), 2))
            .unwrap();
        // Third buffered delta exceeds the window of 2.
        engine
            .process(sourced(delta(3020, 307, 307, &[], &[]), 3))
            .unwrap();
        assert_eq!(engine.counters().gap_discarded_count, 3);

        let out = engine
            .process(sourced(snapshot(3100, 310, &[(100, 42)], &[(200, 10)]), 1))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Snapshot);
        assert_eq!(engine.counters().gap_unrepaired_count, 1);
        assert_eq!(engine.counters().hard_resync_count, 1);
        assert_eq!(engine.book().last_update_id(), Some(310));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(42)));
    }

    /// B3: a gap never advances the id past the missing segment without
    /// repair or resync.
    #[test]
    fn test_gap_never_advances_id() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 300, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(3000, 305, 306, &[(100, 50)], &[]), 1))
            .unwrap();
        assert_eq!(engine.book().last_update_id(), Some(300));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(10)));
    }

    /// Behind snapshots are drift-measurement only.
    #[test]
    fn test_snapshot_behind_keeps_state() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(1100, 101, 101, &[(100, 20)], &[]), 0))
            .unwrap();

        let out = engine
            .process(sourced(snapshot(1200, 100, &[(100, 10)], &[(200, 10)]), 1))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(engine.counters().snapshot_behind_count, 1);
        // State not replaced.
        assert_eq!(engine.book().last_update_id(), Some(101));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(20)));
    }

    /// S6-style: heavy drift beyond the hard threshold forces a resync.
    #[test]
    fn test_drift_hard_resync() {
        let mut engine = engine();
        engine
            .process(sourced(
                snapshot(1000, 100, &[(100, 100_000_000)], &[(200, 100_000_000)]),
                0,
            ))
            .unwrap();

        // A snapshot ahead of us with a wildly different book. The id
        // distance is small so only drift can trigger the resync.
        let out = engine
            .process(sourced(
                snapshot(2000, 105, &[(100, 90_000_000_000)], &[(200, 100_000_000)]),
                1,
            ))
            .unwrap();
        assert_eq!(out.len(), 1);
        let rms = out[0].drift_rms.unwrap();
        assert!(rms > 0.1, "rms {} should exceed the hard threshold", rms);
        assert_eq!(engine.counters().hard_resync_count, 1);
        assert_eq!(engine.book().last_update_id(), Some(105));
        assert_eq!(engine.book().bid_qty(fp(100)), Some(fp(90_000_000_000)));
    }

    /// Id distance beyond max_drift_updates also forces a resync.
    #[test]
    fn test_id_distance_hard_resync() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        let out = engine
            .process(sourced(
                snapshot(2000, 100 + 2_000_000, &[(100, 10)], &[(200, 10)]),
                1,
            ))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(engine.counters().hard_resync_count, 1);
        assert_eq!(engine.book().last_update_id(), Some(100 + 2_000_000));
    }

    /// Bootstrap overflow is fatal.
    #[test]
    fn test_bootstrap_overflow() {
        let config = ReconConfig {
            pending_delta_capacity: 2,
            ..Default::default()
        };
        let mut engine = ReplayEngine::new(config);
        engine.process(sourced(delta(900, 1, 1, &[], &[]), 0)).unwrap();
        engine.process(sourced(delta(910, 2, 2, &[], &[]), 1)).unwrap();
        let err = engine
            .process(sourced(delta(920, 3, 3, &[], &[]), 2))
            .unwrap_err();
        assert!(matches!(err, ReconError::BootstrapOverflow { kind: "delta", .. }));
    }

    /// Marks are unavailable while buffers are outstanding.
    #[test]
    fn test_mark_consistency() {
        let mut engine = engine();
        assert!(engine.mark().is_some()); // Nothing consumed, nothing buffered.

        engine.process(sourced(delta(900, 1, 1, &[], &[]), 0)).unwrap();
        assert!(engine.mark().is_none()); // Pending delta buffered.

        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        let mark = engine.mark().expect("buffers drained");
        assert_eq!(mark.counters.events_processed, 2);
        assert_eq!(mark.book.last_update_id, Some(100));
        assert!(mark.watermark.is_some());
    }

    /// Resume restores book, counters and strict chaining.
    #[test]
    fn test_resume_from_mark() {
        let mut engine = engine();
        engine
            .process(sourced(snapshot(1000, 100, &[(100, 10)], &[(200, 10)]), 0))
            .unwrap();
        engine
            .process(sourced(delta(1100, 101, 101, &[(100, 20)], &[]), 0))
            .unwrap();
        let mark = engine.mark().unwrap();

        let mut resumed = ReplayEngine::resume(ReconConfig::default(), &mark);
        assert_eq!(resumed.state(), ReplayState::Running);
        assert_eq!(resumed.book().last_update_id(), Some(101));

        // R2: a delta already covered by the checkpoint is not re-applied.
        let out = resumed
            .process(sourced(delta(1100, 101, 101, &[(100, 99)], &[]), 0))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(resumed.book().bid_qty(fp(100)), Some(fp(20)));

        // The next chained delta applies normally.
        let out = resumed
            .process(sourced(delta(1200, 102, 102, &[(100, 25)], &[]), 1))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(resumed.book().last_update_id(), Some(102));
    }

    /// Finish emits held trades and terminates.
    #[test]
    fn test_finish_flushes_held_trades() {
        let mut engine = engine();
        engine.process(sourced(trade(800, 1, 100, 10), 0)).unwrap();
        let out = engine.finish();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].trade_id, Some(1));
        assert_eq!(out[0].update_id, None);
        assert_eq!(engine.state(), ReplayState::Terminated);
    }
}
