//! Drift Tracker
//!
//! On every post-bootstrap snapshot the reconstructed book is compared to
//! the arriving snapshot at its top-N levels. Drift is reported and
//! persisted, never fatal: a warn threshold increments a counter, and
//! repeated violations inside a sliding window raise a `DriftAlert`.

use crate::recon::book::OrderBook;
use crate::recon::events::{PriceLevel, SnapshotRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::warn;

/// Snapshots remembered for the sliding alert window.
const ALERT_WINDOW: usize = 100;

/// Warn-threshold violations within the window that raise a `DriftAlert`.
const ALERT_VIOLATIONS: usize = 10;

/// Drift metrics for one snapshot observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftMeasurement {
    /// Root-mean-square quantity error over the union of compared levels,
    /// missing levels counted as zero quantity. Natural units.
    pub rms_qty_err: f64,
    /// Matched levels / snapshot levels.
    pub level_coverage: f64,
    /// |book top-N price set Δ snapshot price set| on the bid side.
    pub bid_price_set_diff: usize,
    /// Same for the ask side.
    pub ask_price_set_diff: usize,
}

impl DriftMeasurement {
    /// Measurement for a freshly applied snapshot (book equals snapshot).
    pub fn zero() -> Self {
        DriftMeasurement {
            rms_qty_err: 0.0,
            level_coverage: 1.0,
            bid_price_set_diff: 0,
            ask_price_set_diff: 0,
        }
    }
}

/// Online accumulator for drift between the book and arriving snapshots.
#[derive(Debug)]
pub struct DriftTracker {
    warn_threshold: f64,
    /// Recent snapshots: true when the warn threshold was exceeded.
    window: VecDeque<bool>,
    /// Whether the window is currently in the alerting state.
    in_alert: bool,
    warn_count: u64,
    alert_count: u64,
    observations: u64,
}

impl DriftTracker {
    pub fn new(warn_threshold: f64) -> Self {
        DriftTracker {
            warn_threshold,
            window: VecDeque::with_capacity(ALERT_WINDOW),
            in_alert: false,
            warn_count: 0,
            alert_count: 0,
            observations: 0,
        }
    }

    #[inline]
    pub fn warn_count(&self) -> u64 {
        self.warn_count
    }

    #[inline]
    pub fn alert_count(&self) -> u64 {
        self.alert_count
    }

    #[inline]
    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Compare the book against a snapshot and update alert state.
    pub fn observe(&mut self, book: &OrderBook, snap: &SnapshotRecord) -> DriftMeasurement {
        let top_n = snap.bids.len().max(snap.asks.len()).max(1);
        let (book_bids, book_asks) = book.top_levels(top_n);

        let (bid_sq_sum, bid_levels, bid_matched, bid_diff) =
            side_drift(&book_bids, &snap.bids);
        let (ask_sq_sum, ask_levels, ask_matched, ask_diff) =
            side_drift(&book_asks, &snap.asks);

        let total_levels = bid_levels + ask_levels;
        let rms_qty_err = if total_levels == 0 {
            0.0
        } else {
            ((bid_sq_sum + ask_sq_sum) / total_levels as f64).sqrt()
        };

        let snap_levels = snap.bids.len() + snap.asks.len();
        let level_coverage = if snap_levels == 0 {
            1.0
        } else {
            (bid_matched + ask_matched) as f64 / snap_levels as f64
        };

        let measurement = DriftMeasurement {
            rms_qty_err,
            level_coverage,
            bid_price_set_diff: bid_diff,
            ask_price_set_diff: ask_diff,
        };

        self.observations += 1;
        let violated = rms_qty_err > self.warn_threshold;
        if violated {
            self.warn_count += 1;
        }
        if self.window.len() == ALERT_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(violated);

        let violations_in_window = self.window.iter().filter(|&&v| v).count();
        if violations_in_window > ALERT_VIOLATIONS {
            if !self.in_alert {
                self.in_alert = true;
                self.alert_count += 1;
                warn!(
                    violations = violations_in_window,
                    window = ALERT_WINDOW,
                    rms_qty_err,
                    "DriftAlert: repeated drift threshold violations"
                );
            }
        } else {
            self.in_alert = false;
        }

        measurement
    }
}

/// Per-side drift: (sum of squared qty errors, compared levels, matched
/// levels, symmetric price-set difference).
fn side_drift(book_levels: &[PriceLevel], snap_levels: &[PriceLevel]) -> (f64, usize, usize, usize) {
    let book_prices: BTreeSet<i64> = book_levels.iter().map(|(p, _)| p.raw()).collect();
    let snap_prices: BTreeSet<i64> = snap_levels.iter().map(|(p, _)| p.raw()).collect();

    let mut sq_sum = 0.0;
    let mut levels = 0usize;
    for &price in book_prices.union(&snap_prices) {
        let book_qty = book_levels
            .iter()
            .find(|(p, _)| p.raw() == price)
            .map(|(_, q)| q.to_f64())
            .unwrap_or(0.0);
        let snap_qty = snap_levels
            .iter()
            .find(|(p, _)| p.raw() == price)
            .map(|(_, q)| q.to_f64())
            .unwrap_or(0.0);
        let err = book_qty - snap_qty;
        sq_sum += err * err;
        levels += 1;
    }

    let matched = book_prices.intersection(&snap_prices).count();
    let diff = book_prices.symmetric_difference(&snap_prices).count();
    (sq_sum, levels, matched, diff)
}
