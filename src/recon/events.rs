//! Event Model
//!
//! Typed records for the three input streams, the deterministic total
//! ordering key of the merged stream, and the unified output event persisted
//! by the sink. All timestamps are exchange-native nanoseconds.

use crate::recon::clock::Nanos;
use crate::recon::fixed::FixedPoint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Column representation in the columnar store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Parse the column representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Side> {
        if s.eq_ignore_ascii_case("buy") {
            Some(Side::Buy)
        } else if s.eq_ignore_ascii_case("sell") {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// A single price level as `(price, quantity)` in fixed-point.
pub type PriceLevel = (FixedPoint, FixedPoint);

/// A trade print from the `trades` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exchange_ts_ns: Nanos,
    pub origin_ts_ns: Nanos,
    pub trade_id: u64,
    pub price: FixedPoint,
    pub quantity: FixedPoint,
    pub side: Side,
}

/// A periodic top-N book snapshot from the `book_snapshots` stream.
/// Levels are sorted best-to-worst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub exchange_ts_ns: Nanos,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// A differential book update from the `book_deltas` stream.
/// A quantity of zero removes the level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub exchange_ts_ns: Nanos,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Closed sum over the three input streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(TradeRecord),
    Snapshot(SnapshotRecord),
    Delta(DeltaRecord),
}

impl MarketEvent {
    #[inline]
    pub fn exchange_ts_ns(&self) -> Nanos {
        match self {
            MarketEvent::Trade(t) => t.exchange_ts_ns,
            MarketEvent::Snapshot(s) => s.exchange_ts_ns,
            MarketEvent::Delta(d) => d.exchange_ts_ns,
        }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::Trade(_) => EventKind::Trade,
            MarketEvent::Snapshot(_) => EventKind::Snapshot,
            MarketEvent::Delta(_) => EventKind::Delta,
        }
    }
}

/// Event class with its deterministic tie-break rank.
///
/// When timestamps collide the merger emits snapshots first (they
/// bootstrap/validate), then deltas (they advance the book), then trades
/// (applied into the already-current book).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    Snapshot = 0,
    Delta = 1,
    Trade = 2,
}

impl EventKind {
    #[inline]
    pub fn type_rank(self) -> u8 {
        self as u8
    }

    /// Column representation of the unified event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Snapshot => "book_snapshot",
            EventKind::Delta => "book_delta",
            EventKind::Trade => "trade",
        }
    }

    /// Parse the column representation.
    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "book_snapshot" => Some(EventKind::Snapshot),
            "book_delta" => Some(EventKind::Delta),
            "trade" => Some(EventKind::Trade),
            _ => None,
        }
    }
}

/// The total order over merged events: `(event_ts_ns, type_rank,
/// tiebreak_seq)`, where `tiebreak_seq` is the cumulative per-stream record
/// index assigned by the reader. Also serves as the resume watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub event_ts_ns: Nanos,
    pub type_rank: u8,
    pub tiebreak_seq: u64,
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event_ts_ns
            .cmp(&other.event_ts_ns)
            .then_with(|| self.type_rank.cmp(&other.type_rank))
            .then_with(|| self.tiebreak_seq.cmp(&other.tiebreak_seq))
    }
}

/// One row of the unified output stream (§ sink schema).
///
/// Exactly one of the three event shapes is populated; the other columns
/// are null in the persisted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub event_ts_ns: Nanos,
    pub event_type: EventKind,
    /// Per-event tie-break sequence, persisted for resume dedup.
    pub tiebreak_seq: u64,
    /// Delta: `final_update_id`. Snapshot: `last_update_id`. Trade: the
    /// book's `last_update_id` at emission time (ordering cross-reference).
    pub update_id: Option<u64>,
    pub trade_id: Option<u64>,
    pub price: Option<FixedPoint>,
    pub quantity: Option<FixedPoint>,
    pub side: Option<Side>,
    pub bids: Option<Vec<PriceLevel>>,
    pub asks: Option<Vec<PriceLevel>>,
    /// Set only on snapshot events.
    pub drift_rms: Option<f64>,
    /// Set only on trade events.
    pub origin_ts_ns: Option<Nanos>,
}

impl UnifiedEvent {
    pub fn from_trade(trade: &TradeRecord, last_update_id: Option<u64>, tiebreak_seq: u64) -> Self {
        UnifiedEvent {
            event_ts_ns: trade.exchange_ts_ns,
            event_type: EventKind::Trade,
            tiebreak_seq,
            update_id: last_update_id,
            trade_id: Some(trade.trade_id),
            price: Some(trade.price),
            quantity: Some(trade.quantity),
            side: Some(trade.side),
            bids: None,
            asks: None,
            drift_rms: None,
            origin_ts_ns: Some(trade.origin_ts_ns),
        }
    }

    pub fn from_delta(delta: &DeltaRecord, tiebreak_seq: u64) -> Self {
        UnifiedEvent {
            event_ts_ns: delta.exchange_ts_ns,
            event_type: EventKind::Delta,
            tiebreak_seq,
            update_id: Some(delta.final_update_id),
            trade_id: None,
            price: None,
            quantity: None,
            side: None,
            bids: Some(delta.bids.clone()),
            asks: Some(delta.asks.clone()),
            drift_rms: None,
            origin_ts_ns: None,
        }
    }

    pub fn from_snapshot(snap: &SnapshotRecord, drift_rms: f64, tiebreak_seq: u64) -> Self {
        UnifiedEvent {
            event_ts_ns: snap.exchange_ts_ns,
            event_type: EventKind::Snapshot,
            tiebreak_seq,
            update_id: Some(snap.last_update_id),
            trade_id: None,
            price: None,
            quantity: None,
            side: None,
            bids: Some(snap.bids.clone()),
            asks: Some(snap.asks.clone()),
            drift_rms: Some(drift_rms),
            origin_ts_ns: None,
        }
    }

    /// Ordering key of this output row.
    #[inline]
    pub fn key(&self) -> OrderKey {
        OrderKey {
            event_ts_ns: self.event_ts_ns,
            type_rank: self.event_type.type_rank(),
            tiebreak_seq: self.tiebreak_seq,
        }
    }
}
