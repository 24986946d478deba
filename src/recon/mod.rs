//! Reconstruction Core
//!
//! Offline, deterministic reconstruction of a unified market-event stream
//! for a single trading symbol from three recorded input streams: trades,
//! periodic L2 book snapshots, and differential book updates (deltas).
//!
//! # Architecture
//!
//! ```text
//!  trades ────┐
//!  snapshots ─┼─> StreamReader x3 ──> EventMerger ──(bounded queue)──┐
//!  deltas ────┘      (chunked,          (k-way,                     │
//!                     restartable)       deterministic tie-break)   ▼
//!                                                            ReplayEngine
//!                                                     (book + drift + gaps)
//!                                                                   │
//!                                            micro-batches + marks  ▼
//!                                                            ColumnarSink
//!                                                  (hourly Parquet + manifest)
//!                                                                   │
//!                                                   committed marks ▼
//!                                                            Checkpointer
//!                                                     (.cpk files, resume)
//! ```
//!
//! One OS process per symbol ([`worker`]); the [`supervisor`] spawns and
//! monitors them and never touches event data.
//!
//! # Determinism Guarantees
//!
//! - All ordering derives from recorded exchange timestamps with the
//!   tie-break `(event_ts_ns, type_rank, tiebreak_seq)`; wall-clock time
//!   only appears in manifest `created_ts_ns` fields.
//! - Identical inputs and configuration reproduce identical output bytes
//!   and identical checkpoint contents.
//! - Resume replays strictly beyond the checkpoint watermark.

pub mod book;
pub mod checkpoint;
pub mod clock;
pub mod columnar;
pub mod config;
pub mod drift;
pub mod error;
pub mod events;
pub mod fixed;
pub mod manifest;
pub mod merge;
pub mod reader;
pub mod replay;
pub mod sink;
pub mod supervisor;
pub mod worker;

pub use book::{BookLevels, OrderBook};
pub use checkpoint::{latest_checkpoint, Checkpointer, RestoredCheckpoint};
pub use clock::{HourBucket, Nanos};
pub use config::{Compression, ReconConfig, SupervisorConfig};
pub use drift::{DriftMeasurement, DriftTracker};
pub use error::ReconError;
pub use events::{
    DeltaRecord, EventKind, MarketEvent, OrderKey, PriceLevel, Side, SnapshotRecord, TradeRecord,
    UnifiedEvent,
};
pub use fixed::FixedPoint;
pub use manifest::{verify_manifest, ManifestEntry, SinkManifest, VerifyReport};
pub use merge::{EventMerger, SourcedEvent};
pub use reader::{ReaderPosition, StreamKind, StreamReader};
pub use replay::{ReplayCounters, ReplayEngine, ReplayMark, ReplayState};
pub use sink::{read_unified_file, ColumnarSink, SinkCommit};
pub use supervisor::run_supervisor;
pub use worker::{run_worker, Heartbeat, ShutdownFlag, WorkerOptions, WorkerStats};
