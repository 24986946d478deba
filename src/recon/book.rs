//! Order Book State
//!
//! Reconstructed L2 book for a single symbol. Two ordered maps keyed by
//! fixed-point price, an authoritative `last_update_id`, and a bootstrap
//! flag. The book is mechanically updated here; sequence classification
//! (duplicates, gaps, bootstrap seam) is the replay engine's job.
//!
//! Ownership: the book is owned exclusively by the replay engine. The only
//! external view is the compact [`BookLevels`] clone captured for
//! checkpointing and drift measurement.

use crate::recon::events::{PriceLevel, SnapshotRecord};
use crate::recon::fixed::FixedPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// L2 order book state.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// Bid levels: price -> quantity (iterate in reverse for best bid).
    bids: BTreeMap<i64, i64>,
    /// Ask levels: price -> quantity (iterate naturally for best ask).
    asks: BTreeMap<i64, i64>,
    /// Authoritative update id; set at bootstrap, advanced by deltas.
    last_update_id: Option<u64>,
    /// True once the first snapshot has been applied.
    bootstrapped: bool,
    /// Snapshots applied (bootstrap + resyncs).
    snapshot_count: u64,
    /// Deltas applied.
    delta_count: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    #[inline]
    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }

    #[inline]
    pub fn snapshot_count(&self) -> u64 {
        self.snapshot_count
    }

    #[inline]
    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }

    #[inline]
    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    #[inline]
    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    #[inline]
    pub fn best_bid(&self) -> Option<FixedPoint> {
        self.bids.keys().next_back().copied().map(FixedPoint::from_raw)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<FixedPoint> {
        self.asks.keys().next().copied().map(FixedPoint::from_raw)
    }

    /// True when best bid >= best ask with both sides populated.
    #[inline]
    pub fn is_crossed(&self) -> bool {
        match (self.bids.keys().next_back(), self.asks.keys().next()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Replace the entire book with a snapshot's contents.
    ///
    /// Zero-quantity levels in the snapshot are dropped so positivity holds
    /// unconditionally afterwards.
    pub fn apply_snapshot(&mut self, snap: &SnapshotRecord) {
        self.bids.clear();
        self.asks.clear();
        for (price, qty) in &snap.bids {
            if qty.is_positive() {
                self.bids.insert(price.raw(), qty.raw());
            }
        }
        for (price, qty) in &snap.asks {
            if qty.is_positive() {
                self.asks.insert(price.raw(), qty.raw());
            }
        }
        self.last_update_id = Some(snap.last_update_id);
        self.bootstrapped = true;
        self.snapshot_count += 1;
    }

    /// Apply one delta's level changes and advance `last_update_id`.
    ///
    /// The caller has already validated the sequence seam; this only moves
    /// levels. Quantity zero removes the level, positive replaces it.
    pub fn apply_delta_levels(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        final_update_id: u64,
    ) {
        for (price, qty) in bids {
            if qty.is_positive() {
                self.bids.insert(price.raw(), qty.raw());
            } else {
                self.bids.remove(&price.raw());
            }
        }
        for (price, qty) in asks {
            if qty.is_positive() {
                self.asks.insert(price.raw(), qty.raw());
            } else {
                self.asks.remove(&price.raw());
            }
        }
        self.last_update_id = Some(final_update_id);
        self.delta_count += 1;
    }

    /// Top-K levels per side, best first.
    pub fn top_levels(&self, k: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(k)
            .map(|(&p, &q)| (FixedPoint::from_raw(p), FixedPoint::from_raw(q)))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(k)
            .map(|(&p, &q)| (FixedPoint::from_raw(p), FixedPoint::from_raw(q)))
            .collect();
        (bids, asks)
    }

    /// Quantity at a bid price, if the level exists.
    #[inline]
    pub fn bid_qty(&self, price: FixedPoint) -> Option<FixedPoint> {
        self.bids.get(&price.raw()).copied().map(FixedPoint::from_raw)
    }

    /// Quantity at an ask price, if the level exists.
    #[inline]
    pub fn ask_qty(&self, price: FixedPoint) -> Option<FixedPoint> {
        self.asks.get(&price.raw()).copied().map(FixedPoint::from_raw)
    }

    /// Compact copy of the full book for checkpointing.
    ///
    /// O(live levels); captured only at sink-batch boundaries so the replay
    /// loop never blocks on checkpoint serialization.
    pub fn clone_levels(&self) -> BookLevels {
        BookLevels {
            bids: self.bids.iter().rev().map(|(&p, &q)| (p, q)).collect(),
            asks: self.asks.iter().map(|(&p, &q)| (p, q)).collect(),
            last_update_id: self.last_update_id,
            bootstrapped: self.bootstrapped,
        }
    }

    /// Rebuild book state from a checkpointed clone.
    pub fn restore(levels: &BookLevels) -> Self {
        let mut book = OrderBook::new();
        for &(price, qty) in &levels.bids {
            if qty > 0 {
                book.bids.insert(price, qty);
            }
        }
        for &(price, qty) in &levels.asks {
            if qty > 0 {
                book.asks.insert(price, qty);
            }
        }
        book.last_update_id = levels.last_update_id;
        book.bootstrapped = levels.bootstrapped;
        book
    }
}

/// Immutable compact book snapshot: raw `(price, qty)` pairs per side,
/// bids best-first (descending), asks best-first (ascending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevels {
    pub bids: Vec<(i64, i64)>,
    pub asks: Vec<(i64, i64)>,
    pub last_update_id: Option<u64>,
    pub bootstrapped: bool,
}

impl BookLevels {
    pub fn empty() -> Self {
        BookLevels {
            bids: Vec::new(),
            asks: Vec::new(),
            last_update_id: None,
            bootstrapped: false,
        }
    }
}
