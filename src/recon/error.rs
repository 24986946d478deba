//! Error Taxonomy
//!
//! Fatal errors terminate the worker with a specific process exit code and
//! leave the last completed checkpoint intact. Recoverable conditions
//! (sequence gaps, behind snapshots, drift alerts, transient I/O) are
//! handled locally by the replay engine and sink and never appear here.

use thiserror::Error;

/// Worker-terminating errors.
#[derive(Debug, Error)]
pub enum ReconError {
    /// A required column is missing or has the wrong type.
    #[error("schema mismatch in {file}: {detail}")]
    SchemaMismatch { file: String, detail: String },

    /// Exchange timestamps went backwards within or across input files.
    #[error("input out of order in {file} at row {row}: ts {ts} < previous {prev_ts}")]
    InputOutOfOrder {
        file: String,
        row: u64,
        prev_ts: u64,
        ts: u64,
    },

    /// A row could not be decoded into a typed record.
    #[error("decode error in {file} at row {row}: {detail}")]
    DecodeError {
        file: String,
        row: u64,
        detail: String,
    },

    /// Fixed-point arithmetic left the representable range.
    #[error("arithmetic overflow during {op}: lhs={lhs} rhs={rhs}")]
    ArithmeticOverflow {
        op: &'static str,
        lhs: i64,
        rhs: i64,
    },

    /// An input value needs more than eight fractional digits.
    #[error("precision loss: {value} is not representable at scale 1e8")]
    PrecisionLoss { value: String },

    /// The pre-bootstrap buffer filled before a usable snapshot arrived.
    #[error("bootstrap overflow: {kind} buffer exceeded capacity {capacity}")]
    BootstrapOverflow { kind: &'static str, capacity: usize },

    /// A checkpoint failed hash or format-version validation.
    #[error("checkpoint corruption in {path}: {detail}")]
    CheckpointCorruption { path: String, detail: String },

    /// The sink failed persistently after bounded retries.
    #[error("sink unavailable: {detail}")]
    SinkUnavailable { detail: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// A pipeline stage disappeared while its peers were still running.
    #[error("pipeline stage failed: {0}")]
    Pipeline(String),
}

impl ReconError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconError::Config(_) => 2,
            ReconError::SchemaMismatch { .. } => 3,
            ReconError::SinkUnavailable { .. } => 4,
            ReconError::CheckpointCorruption { .. } => 5,
            ReconError::ArithmeticOverflow { .. } | ReconError::PrecisionLoss { .. } => 6,
            ReconError::BootstrapOverflow { .. } => 7,
            ReconError::InputOutOfOrder { .. } => 8,
            ReconError::DecodeError { .. }
            | ReconError::Io(_)
            | ReconError::Parquet(_)
            | ReconError::Arrow(_)
            | ReconError::Pipeline(_) => 1,
        }
    }
}
