//! Event Time
//!
//! Nanosecond timestamps with UTC hour-partition helpers.
//! All replay time is derived from recorded exchange timestamps,
//! never from system time.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
/// Matches the `exchange_ts_ns`/`origin_ts_ns` columns of the input store.
pub type Nanos = u64;

/// Conversion constants
pub const NANOS_PER_MICRO: u64 = 1_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_HOUR: u64 = 3_600 * NANOS_PER_SEC;

/// UTC hour bucket an event falls into. Output files are partitioned by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourBucket {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl HourBucket {
    /// Bucket for a nanosecond timestamp.
    pub fn from_nanos(ts_ns: Nanos) -> Self {
        let secs = (ts_ns / NANOS_PER_SEC) as i64;
        let dt: DateTime<Utc> = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }

    /// Relative partition directory, e.g. `year=2026/month=03/day=07/hour=14`.
    pub fn partition_path(&self) -> String {
        format!(
            "year={:04}/month={:02}/day={:02}/hour={:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}
