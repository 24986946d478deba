//! Configuration
//!
//! The closed set of tunables for a reconstruction worker plus the
//! supervisor's symbol roster. Files are TOML; every field has the
//! documented default so an empty file is a valid configuration.

use crate::recon::error::ReconError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Output compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Snappy,
    Zstd,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Snappy
    }
}

/// Worker configuration (closed set).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconConfig {
    /// Sink micro-batch row threshold.
    pub batch_rows: usize,
    /// Sink micro-batch age threshold in milliseconds.
    pub batch_age_ms: u64,
    /// Bounded queue capacity between merger and replay engine.
    pub queue_capacity: usize,
    /// Pre-bootstrap delta buffer capacity; overflow is fatal.
    pub pending_delta_capacity: usize,
    /// Drift warning threshold (rms quantity error, natural units).
    pub drift_rms_warn: f64,
    /// Drift hard-resync threshold.
    pub drift_rms_hard_reset: f64,
    /// Hard-resync when |last_update_id - snapshot id| exceeds this.
    pub max_drift_updates: u64,
    /// Forward-repair window after a sequence gap, in deltas.
    pub max_repair_events: usize,
    /// Checkpoint every N processed events.
    pub checkpoint_events: u64,
    /// Checkpoint at least every N milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Emergency-stop grace for the final checkpoint.
    pub shutdown_grace_ms: u64,
    /// Output compression codec.
    pub compression: Compression,
    /// Fixed-point scale for prices/quantities. Fixed at 1e8.
    pub price_scale: i64,
    /// FP -> decimal128(38,18) widening factor. Fixed at 1e10.
    pub output_decimal_scale: i64,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            batch_rows: 100_000,
            batch_age_ms: 5_000,
            queue_capacity: 8_192,
            pending_delta_capacity: 65_536,
            drift_rms_warn: 1e-3,
            drift_rms_hard_reset: 1e-1,
            max_drift_updates: 1_000_000,
            max_repair_events: 1_024,
            checkpoint_events: 1_000_000,
            checkpoint_interval_ms: 300_000,
            shutdown_grace_ms: 2_000,
            compression: Compression::Snappy,
            price_scale: 100_000_000,
            output_decimal_scale: 10_000_000_000,
        }
    }
}

impl ReconConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ReconError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReconError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ReconConfig = toml::from_str(&text)
            .map_err(|e| ReconError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject impossible or contract-breaking values.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.price_scale != 100_000_000 {
            return Err(ReconError::Config(
                "price_scale is fixed at 100000000".into(),
            ));
        }
        if self.output_decimal_scale != 10_000_000_000 {
            return Err(ReconError::Config(
                "output_decimal_scale is fixed at 10000000000".into(),
            ));
        }
        if self.batch_rows == 0 {
            return Err(ReconError::Config("batch_rows must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ReconError::Config("queue_capacity must be positive".into()));
        }
        if self.pending_delta_capacity == 0 {
            return Err(ReconError::Config(
                "pending_delta_capacity must be positive".into(),
            ));
        }
        if self.max_repair_events == 0 {
            return Err(ReconError::Config(
                "max_repair_events must be positive".into(),
            ));
        }
        if self.drift_rms_warn <= 0.0 || self.drift_rms_hard_reset <= 0.0 {
            return Err(ReconError::Config(
                "drift thresholds must be positive".into(),
            ));
        }
        if self.drift_rms_hard_reset < self.drift_rms_warn {
            return Err(ReconError::Config(
                "drift_rms_hard_reset must not be below drift_rms_warn".into(),
            ));
        }
        if self.checkpoint_events == 0 {
            return Err(ReconError::Config(
                "checkpoint_events must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Supervisor configuration: the symbol roster plus shared roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Symbols to reconstruct, one worker process each.
    pub symbols: Vec<String>,
    /// Root of the per-symbol input store.
    pub input_root: String,
    /// Root of the per-symbol output store.
    pub output_root: String,
    /// Resume workers from their latest checkpoints.
    #[serde(default)]
    pub resume: bool,
    /// Maximum restarts before a symbol is left stopped (backoff caps
    /// independently at 60s).
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Worker tunables applied to every symbol.
    #[serde(default)]
    pub worker: ReconConfig,
}

fn default_max_restarts() -> u32 {
    5
}

impl SupervisorConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ReconError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReconError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SupervisorConfig = toml::from_str(&text)
            .map_err(|e| ReconError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.symbols.is_empty() {
            return Err(ReconError::Config("no symbols configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for symbol in &self.symbols {
            if symbol.is_empty() || !symbol.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            {
                return Err(ReconError::Config(format!("invalid symbol {:?}", symbol)));
            }
            if !seen.insert(symbol) {
                return Err(ReconError::Config(format!("duplicate symbol {:?}", symbol)));
            }
        }
        self.worker.validate()
    }
}
