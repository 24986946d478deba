//! Reconstruct
//!
//! Deterministic replay of recorded trades, L2 snapshots and book deltas
//! into a unified, drift-tracked market event stream with atomic columnar
//! output and copy-on-write checkpoints.

pub mod recon;

pub use recon::{
    ColumnarSink, EventMerger, FixedPoint, MarketEvent, OrderBook, ReconConfig, ReconError,
    ReplayEngine, StreamReader, UnifiedEvent,
};
